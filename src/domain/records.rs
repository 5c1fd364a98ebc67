#![allow(dead_code)]

use chrono::{DateTime, Utc};

use super::fulfillment::Fulfillment;
use super::value_objects::{CollectionId, Identifier, RIGHTS_IN_COPYRIGHT};
use crate::domain::entities::Resource;

/// 転送レコード共通の識別ブロック
///
/// アダプタ境界で貸出・予約・フルフィルメントを記述する際の出所情報。
/// `collection_id` は生成時点では欠けていてもよいが（DBハンドルを持たない
/// 文脈で生成されるため）、レコードをライセンスプールへ解決する前には
/// 必ず設定されていなければならない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CirculationSource {
    pub collection_id: Option<CollectionId>,
    pub data_source_name: String,
    pub identifier: Identifier,
}

impl CirculationSource {
    pub fn new(
        collection_id: Option<CollectionId>,
        data_source_name: impl Into<String>,
        identifier: Identifier,
    ) -> Self {
        Self {
            collection_id,
            data_source_name: data_source_name.into(),
            identifier,
        }
    }
}

/// リモート側の貸出を表す転送レコード
///
/// ORM的な同一性を持たない。エンジンがローカルの貸出行へ翻訳する。
#[derive(Debug, Clone)]
pub struct LoanActivity {
    pub source: CirculationSource,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// ベンダーが貸出と同時に返すフルフィルメント（あれば）
    pub fulfillment: Option<Fulfillment>,
    /// 貸出が特定の配信方式に束縛済みであることの報告
    pub locked_to: Option<DeliveryMechanismInfo>,
    pub external_identifier: Option<String>,
}

impl LoanActivity {
    pub fn new(
        source: CirculationSource,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            source,
            start_date,
            end_date,
            fulfillment: None,
            locked_to: None,
            external_identifier: None,
        }
    }
}

/// リモート側の予約を表す転送レコード
///
/// `hold_position == None` は「不明。次回同期で解決」。
/// 先頭（1番目）として扱ってはならない。
#[derive(Debug, Clone)]
pub struct HoldActivity {
    pub source: CirculationSource,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub hold_position: Option<u32>,
    pub external_identifier: Option<String>,
}

impl HoldActivity {
    pub fn new(
        source: CirculationSource,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
        hold_position: Option<u32>,
    ) -> Self {
        Self {
            source,
            start_date,
            end_date,
            hold_position,
            external_identifier: None,
        }
    }
}

/// checkout操作の結果
///
/// ベンダーは貸出を作れない場合、例外を投げる代わりに
/// 予約へ格下げして返すことがある。
#[derive(Debug, Clone)]
pub enum CheckoutOutcome {
    Loan(LoanActivity),
    Hold(HoldActivity),
}

/// 利用者アクティビティの1項目（貸出または予約）
#[derive(Debug, Clone)]
pub enum ActivityItem {
    Loan(LoanActivity),
    Hold(HoldActivity),
}

/// 貸出が束縛されるべき配信方式の報告
///
/// ベンダーから「この貸出は特定の (コンテンツ種別, DRM方式) に
/// 確定済み」と報告された際の記録。ストアが貸出へ適用する：
/// 配信方式とLPDMを必要に応じて作成し、貸出の fulfillment に設定する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMechanismInfo {
    pub content_type: Option<String>,
    pub drm_scheme: Option<String>,
    pub rights_uri: Option<String>,
    pub resource: Option<Resource>,
}

impl DeliveryMechanismInfo {
    pub fn new(content_type: Option<String>, drm_scheme: Option<String>) -> Self {
        Self {
            content_type,
            drm_scheme,
            rights_uri: Some(RIGHTS_IN_COPYRIGHT.to_string()),
            resource: None,
        }
    }

    pub fn with_rights(mut self, rights_uri: Option<String>) -> Self {
        self.rights_uri = rights_uri;
        self
    }

    pub fn with_resource(mut self, resource: Option<Resource>) -> Self {
        self.resource = resource;
        self
    }
}
