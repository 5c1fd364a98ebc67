use async_trait::async_trait;

use crate::domain::events::CirculationEvent;

/// 分析シンクポート
///
/// エンジンはDBコミットの後にのみイベントを送出する。送出は
/// fire-and-forget であり、シンク側の失敗が循環操作を失敗させては
/// ならない（シグネチャ上も失敗を返せない。実装は内部でログに記録して
/// 揉み消すこと）。
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// 循環イベントを記録する
    async fn collect_event(&self, event: CirculationEvent);
}
