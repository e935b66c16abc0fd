pub mod calendar;

pub use calendar::{MarketCalendar, WeekdayMask};
