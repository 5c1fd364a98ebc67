#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 利用者ID - 利用者管理コンテキストへの参照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatronId(Uuid);

impl PatronId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for PatronId {
    fn default() -> Self {
        Self::new()
    }
}

/// 図書館ID - テナント（図書館）への参照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LibraryId(Uuid);

impl LibraryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for LibraryId {
    fn default() -> Self {
        Self::new()
    }
}

/// コレクションID - 配信事業者コレクションの整数ID
///
/// ベンダーアダプタから返される転送レコードは、DBハンドルを持たない
/// 文脈で生成されることがあるため、ハンドルではなく整数IDで参照する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(i64);

impl CollectionId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

/// ライセンスプールID - 1タイトル×1コレクションの在庫レコードのID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LicensePoolId(Uuid);

impl LicensePoolId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for LicensePoolId {
    fn default() -> Self {
        Self::new()
    }
}

/// 貸出ID - 貸出管理コンテキストの集約ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoanId(Uuid);

impl LoanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for LoanId {
    fn default() -> Self {
        Self::new()
    }
}

/// 予約ID - 予約管理コンテキストの集約ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldId(Uuid);

impl HoldId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for HoldId {
    fn default() -> Self {
        Self::new()
    }
}

/// 配信方式ID - (コンテンツ種別, DRM方式) の組のID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryMechanismId(Uuid);

impl DeliveryMechanismId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for DeliveryMechanismId {
    fn default() -> Self {
        Self::new()
    }
}

/// LPDM ID - ライセンスプール上の配信方式（LicensePoolDeliveryMechanism）のID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LpdmId(Uuid);

impl LpdmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for LpdmId {
    fn default() -> Self {
        Self::new()
    }
}

/// 書誌識別子
///
/// (識別子種別, 識別子文字列) の組。ISBNやベンダー固有IDなど。
/// ローカルとリモートの貸出・予約を突き合わせるキーとして使用される。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub identifier_type: String,
    pub identifier: String,
}

impl Identifier {
    pub fn new(identifier_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            identifier_type: identifier_type.into(),
            identifier: identifier.into(),
        }
    }
}

/// ストリーミング配信を示すメディアタイププロファイル
///
/// コンテンツ種別がこのプロファイルで終わる配信方式はストリーミング扱いとなり、
/// 貸出を単一フォーマットに束縛しない。
pub const STREAMING_PROFILE: &str =
    ";profile=http://librarysimplified.org/terms/profiles/streaming-media";

/// 著作権保護下を示すデフォルトの権利URI
pub const RIGHTS_IN_COPYRIGHT: &str = "http://www.librarysimplified.org/rights-status/in-copyright";

/// 一般的なオープンアクセスを示す権利URI
pub const RIGHTS_GENERIC_OPEN_ACCESS: &str =
    "http://librarysimplified.org/terms/rights-status/generic-open-access";

/// 米国でパブリックドメインであることを示す権利URI
pub const RIGHTS_PUBLIC_DOMAIN_USA: &str =
    "http://librarysimplified.org/terms/rights-status/public-domain-usa";

/// 権利URIがオープンアクセス配信を許すか
///
/// リソース付きのオープンアクセスLPDMが報告された場合、
/// ライセンスプール自体がオープンアクセスへ昇格することがある。
pub fn rights_uri_is_open_access(uri: &str) -> bool {
    uri == RIGHTS_GENERIC_OPEN_ACCESS
        || uri == RIGHTS_PUBLIC_DOMAIN_USA
        || uri.starts_with("https://creativecommons.org/licenses/")
}
