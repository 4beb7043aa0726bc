pub mod backoff;
pub mod beacon;
pub mod utils;
pub use self::backoff::*;
pub use self::beacon::*;
