use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value_objects::{LibraryId, LicensePoolId};

/// 循環イベント種別
///
/// エンジンがDBコミット後に分析シンクへ送出するイベントの名前。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CirculationEventType {
    CheckOut,
    CheckIn,
    HoldPlace,
    HoldRelease,
    Fulfill,
}

impl CirculationEventType {
    /// 分析基盤へ送るワイヤ名
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckOut => "circulation_manager_check_out",
            Self::CheckIn => "circulation_manager_check_in",
            Self::HoldPlace => "circulation_manager_hold_place",
            Self::HoldRelease => "circulation_manager_hold_release",
            Self::Fulfill => "circulation_manager_fulfill",
        }
    }
}

/// 循環イベント
///
/// `neighborhood` は、現在のリクエストの認証済み利用者がイベントの
/// 帰属先利用者と同一である場合にのみ付与される（利用者の識別情報は
/// 運ばない）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CirculationEvent {
    pub library_id: LibraryId,
    pub license_pool_id: Option<LicensePoolId>,
    pub name: CirculationEventType,
    pub neighborhood: Option<String>,
    pub time: DateTime<Utc>,
}
