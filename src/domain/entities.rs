#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value_objects::{
    CollectionId, DeliveryMechanismId, HoldId, Identifier, LibraryId, LicensePoolId, LoanId,
    LpdmId, PatronId, STREAMING_PROFILE,
};

/// 図書館ごとの貸出ポリシー設定
///
/// `loan_limit` / `hold_limit` は None または 0 で無制限を意味する。
/// 設定ドキュメントに現れないキーはデフォルト値で補われる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    pub loan_limit: Option<u32>,
    pub hold_limit: Option<u32>,
    /// false の場合、この図書館では予約を新規に作成できない
    pub allow_holds: bool,
    pub default_notification_email_address: Option<String>,
    pub max_outstanding_fines: Option<f64>,
    pub default_loan_duration_days: Option<u32>,
    pub ebook_loan_duration_days: Option<u32>,
    /// コアでは未使用。フィルタ層へそのまま伝播される
    pub minimum_featured_quality: Option<f64>,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            loan_limit: None,
            hold_limit: None,
            allow_holds: true,
            default_notification_email_address: None,
            max_outstanding_fines: None,
            default_loan_duration_days: None,
            ebook_loan_duration_days: None,
            minimum_featured_quality: None,
        }
    }
}

/// 図書館 - 循環管理のテナント
///
/// 各図書館は自身のポリシーとコレクション群を所有する。
/// 利用者はちょうど1つの図書館に属する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
    pub settings: LibrarySettings,
}

/// 利用者 - 認証済みの図書館ユーザーのスナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patron {
    pub id: PatronId,
    pub library_id: LibraryId,
    pub authorization_identifier: String,
    pub authorization_expires: Option<DateTime<Utc>>,
    pub fines: f64,
    pub block_reason: Option<String>,
    /// ILSから取得される地区情報（分析イベントにのみ使用）
    pub neighborhood: Option<String>,
    pub external_type: Option<String>,
    /// 蔵書棚同期の鮮度スタンプ
    ///
    /// 同期開始直前の時刻が設定され、部分失敗時と貸出・返却・予約解除の
    /// 各変更操作時にクリアされる。クリアは次回同期を強制する。
    pub last_loan_activity_sync: Option<DateTime<Utc>>,
}

/// コレクション - 1配信事業者から提供されるライセンスコンテンツ群
///
/// `protocol` がベンダーアダプタの種類を選択する。
/// `integration_configuration` はアダプタ自身が解釈する不透明な設定値。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub library_id: LibraryId,
    pub name: String,
    pub protocol: String,
    pub integration_configuration: serde_json::Value,
}

/// 配信方式 - (コンテンツ種別, DRM方式) の組
///
/// `drm_scheme == None` はDRMフリー配信を意味する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMechanism {
    pub id: DeliveryMechanismId,
    pub content_type: Option<String>,
    pub drm_scheme: Option<String>,
}

impl DeliveryMechanism {
    /// ストリーミング配信方式か
    ///
    /// ストリーミング方式は貸出を単一フォーマットに束縛しない。
    pub fn is_streaming(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.ends_with(STREAMING_PROFILE))
    }

    /// 2つの配信方式が互換か
    ///
    /// 同一の (コンテンツ種別, DRM方式) であるか、どちらかがストリーミング
    /// 方式であれば互換とみなす。利用者は1つの貸出を複数のDRM方式に
    /// またがって消費することはできない。
    pub fn compatible_with(&self, other: &DeliveryMechanism) -> bool {
        if self.content_type == other.content_type && self.drm_scheme == other.drm_scheme {
            return true;
        }
        self.is_streaming() || other.is_streaming()
    }
}

/// 取得済みコンテンツの表現
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    pub media_type: Option<String>,
    /// インライン保持されたコンテンツ（オープンアクセス書籍など）
    pub content: Option<String>,
    pub public_url: Option<String>,
}

/// リソース - 直接配信可能なコンテンツへの参照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub url: String,
    pub representation: Option<Representation>,
}

/// ライセンスプール上の配信方式（LPDM）
///
/// あるタイトルをこのプール経由で配信する際に選択可能な1方式。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicensePoolDeliveryMechanism {
    pub id: LpdmId,
    pub license_pool_id: LicensePoolId,
    pub data_source: String,
    pub identifier: Identifier,
    pub mechanism: DeliveryMechanism,
    pub rights_uri: Option<String>,
    pub resource: Option<Resource>,
}

/// ライセンスプール - 1タイトル×1コレクションの在庫レコード
///
/// 不変条件：プールはちょうど1つのコレクションに属し、
/// (data_source, identifier_type, identifier, collection) は一意。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicensePool {
    pub id: LicensePoolId,
    pub collection_id: CollectionId,
    pub data_source: String,
    pub identifier: Identifier,
    pub open_access: bool,
    pub unlimited_access: bool,
    pub licenses_owned: i32,
    pub licenses_available: i32,
    pub patrons_in_hold_queue: i32,
    pub delivery_mechanisms: Vec<LicensePoolDeliveryMechanism>,
}

/// 貸出 - 利用者とライセンスプールの貸出関係（永続レコード）
///
/// 不変条件：(patron, license_pool) の組につき貸出は高々1件。
/// `end == None` は無期限貸出。`fulfillment_id` は利用者が配信方式を
/// 確定した時点で設定される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub patron_id: PatronId,
    pub license_pool_id: LicensePoolId,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub fulfillment_id: Option<LpdmId>,
    pub external_identifier: Option<String>,
}

/// 予約 - 利用者とライセンスプールの予約関係（永続レコード）
///
/// 不変条件：(patron, license_pool) の組につき予約は高々1件。
/// `position == Some(0)` は取り置き済み（貸出可能）。
/// `position == None` は「不明。次回同期で解決」であり、
/// 先頭（1番目）として表示してはならない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub patron_id: PatronId,
    pub license_pool_id: LicensePoolId,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub position: Option<u32>,
    pub external_identifier: Option<String>,
}

impl Hold {
    /// 取り置き済み（position == 0）か
    pub fn is_reserved(&self) -> bool {
        self.position == Some(0)
    }
}

/// 資格情報 - アダプタが使うベアラートークン等
///
/// コアは内容を解釈せず、ポート経由で保存・取得のみ行う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub data_source: String,
    pub credential_type: String,
    pub collection_id: Option<CollectionId>,
    pub patron_id: Option<PatronId>,
    pub credential: String,
    pub expires: Option<DateTime<Utc>>,
}

impl Credential {
    /// 期限切れ判定
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}
