pub mod booking;
pub mod cancel;
pub mod notification;
pub mod reschedule;

pub use self::booking::*;
pub use self::cancel::*;
pub use self::notification::*;
pub use self::reschedule::*;
