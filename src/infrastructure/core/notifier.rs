use async_trait::async_trait;
use tracing::info;

use crate::application::{NotificationError, NotificationEvent, Notifier};

/// ログに流すだけの通知実装
///
/// 実際の配送(メール・プッシュ等)は範囲外のコラボレーターが担う。
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        info!(?event, "notification event emitted");
        Ok(())
    }
}
