pub mod bar;
pub mod interval;
pub mod option;
pub mod series;

pub use bar::{BarRecord, RawBar, COLUMNS};
pub use interval::{parse_interval, Interval};
pub use option::{Moneyness, OptionContract, OptionSnapshot, OptionType, OPTION_COLUMNS};
pub use series::Series;
