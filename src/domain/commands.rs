use serde::{Deserialize, Serialize};

use super::value_objects::{LicensePoolId, LpdmId, PatronId};

/// コマンド：書籍を借りる（または予約する）
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowBook {
    pub patron_id: PatronId,
    pub pin: String,
    pub license_pool_id: LicensePoolId,
    /// アダプタが貸出時点で配信方式の確定を要求する場合は必須
    pub delivery_mechanism: Option<LpdmId>,
    /// 予約成立時の通知先。未指定なら図書館のデフォルトを使う
    pub hold_notification_email: Option<String>,
}

/// コマンド：貸出をフルフィルする
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillBook {
    pub patron_id: PatronId,
    pub pin: String,
    pub license_pool_id: LicensePoolId,
    pub delivery_mechanism: LpdmId,
    /// 貸出が見つからない場合に1回だけ同期して再試行する
    pub sync_on_failure: bool,
}

/// コマンド：貸出を取り消す（返却）
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeLoan {
    pub patron_id: PatronId,
    pub pin: String,
    pub license_pool_id: LicensePoolId,
}

/// コマンド：予約を解除する
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseHold {
    pub patron_id: PatronId,
    pub pin: String,
    pub license_pool_id: LicensePoolId,
}

/// コマンド：蔵書棚を同期する
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBookshelf {
    pub patron_id: PatronId,
    pub pin: String,
    /// true なら鮮度スタンプを無視して必ずベンダーへ問い合わせる
    pub force: bool,
}
