mod booking;
mod notifier;
mod reschedule;
mod slot;

pub use self::booking::*;
pub use self::notifier::*;
pub use self::reschedule::*;
pub use self::slot::*;
