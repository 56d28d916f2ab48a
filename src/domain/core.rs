mod booking;
mod money;
mod reschedule;
mod slot;

use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};

use super::Id;

pub use self::booking::*;
pub use self::money::*;
pub use self::reschedule::*;
pub use self::slot::*;

/// お客様ID
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct CustomerId(u64);

impl Id for CustomerId {
    type Inner = u64;
}

/// 管理者ID
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct AdminId(u64);

impl Id for AdminId {
    type Inner = u64;
}

/// 操作主体
///
/// 認証・認可は外部コラボレーターの責務であり、ここでは監査履歴に残す識別子として扱う。
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// お客様
    Customer(CustomerId),
    /// 管理者
    Admin(AdminId),
    /// システム
    System,
}
