#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

use super::errors::{CirculationError, CirculationResult};
use super::records::CirculationSource;

/// HTTP層へのレスポンス上書き指示
///
/// 通常の描画処理を迂回させたいフルフィルメント（ベアラートークン文書の
/// 直接返却など）が使う。コア自身はこの内容を解釈しない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentResponse {
    pub status: u16,
    pub media_type: Option<String>,
    pub body: String,
}

/// 貸出を「いま」ダウンロード可能にするための情報
///
/// 不変条件：`content_link` と `content` のちょうど一方がペイロードを運ぶ。
/// `content_link_redirect` はHTTP層への「リンクへリダイレクトせよ」指示。
#[derive(Debug, Clone, Default)]
pub struct FulfillmentData {
    pub content_link: Option<String>,
    pub content_type: Option<String>,
    pub content: Option<String>,
    pub content_expires: Option<DateTime<Utc>>,
    pub content_link_redirect: bool,
    /// 標準の描画処理を上書きする場合のみ Some
    pub response_override: Option<FulfillmentResponse>,
}

impl FulfillmentData {
    /// リンクまたは本文のどちらかを持つか
    pub fn has_payload(&self) -> bool {
        self.content_link.is_some() || self.content.is_some()
    }
}

/// 遅延フルフィルメントの取得フック
///
/// 完全なフルフィルメント情報の生成が高価な場合（ベアラートークンの取得と
/// CDN URLの解決など）に、最初のフィールド参照まで呼び出しを遅延させる。
#[async_trait]
pub trait FulfillmentFetch: Send + Sync {
    /// ベンダーへ問い合わせてフルフィルメント情報を生成する
    ///
    /// `content_link` / `content` の少なくとも一方に加え、
    /// `content_type` と `content_expires` を設定して返すこと。
    async fn do_fetch(&self, key: &serde_json::Value) -> CirculationResult<FulfillmentData>;
}

struct DeferredInner {
    source: CirculationSource,
    key: serde_json::Value,
    fetcher: Arc<dyn FulfillmentFetch>,
    fetched: OnceCell<FulfillmentData>,
}

/// 遅延フルフィルメント
///
/// コンテンツ系フィールドの最初の参照時に、ちょうど1回だけ
/// `FulfillmentFetch::do_fetch` を呼んで値を埋める。2回目以降の参照は
/// キャッシュを返す。取得の失敗はエラーとして伝播し、インスタンスを
/// 「取得済み」にはしない（同一インスタンスでの再試行が可能）。
///
/// 参照は遅延I/Oを伴うため、すべてのアクセサは async となる。
/// 取得後の値を書き換えるAPIは提供しない。
#[derive(Clone)]
pub struct DeferredFulfillment {
    inner: Arc<DeferredInner>,
}

impl DeferredFulfillment {
    pub fn new(
        source: CirculationSource,
        key: serde_json::Value,
        fetcher: Arc<dyn FulfillmentFetch>,
    ) -> Self {
        Self {
            inner: Arc::new(DeferredInner {
                source,
                key,
                fetcher,
                fetched: OnceCell::new(),
            }),
        }
    }

    pub fn source(&self) -> &CirculationSource {
        &self.inner.source
    }

    /// 取得済みデータへの参照（未取得なら1回だけ取得する）
    async fn data(&self) -> CirculationResult<&FulfillmentData> {
        self.inner
            .fetched
            .get_or_try_init(|| async { self.inner.fetcher.do_fetch(&self.inner.key).await })
            .await
    }

    pub async fn content_link(&self) -> CirculationResult<Option<String>> {
        Ok(self.data().await?.content_link.clone())
    }

    pub async fn content_type(&self) -> CirculationResult<Option<String>> {
        Ok(self.data().await?.content_type.clone())
    }

    pub async fn content(&self) -> CirculationResult<Option<String>> {
        Ok(self.data().await?.content.clone())
    }

    pub async fn content_expires(&self) -> CirculationResult<Option<DateTime<Utc>>> {
        Ok(self.data().await?.content_expires)
    }

    pub async fn content_link_redirect(&self) -> CirculationResult<bool> {
        Ok(self.data().await?.content_link_redirect)
    }
}

impl std::fmt::Debug for DeferredFulfillment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredFulfillment")
            .field("source", &self.inner.source)
            .field("fetched", &self.inner.fetched.initialized())
            .finish()
    }
}

/// フルフィルメント - 即値または遅延取得
///
/// ベンダーは即座に完全な情報を返すか（Eager）、最初の参照まで
/// 取得を遅延するか（Deferred）のどちらかを選べる。
#[derive(Debug, Clone)]
pub enum Fulfillment {
    Eager(FulfillmentData),
    Deferred(DeferredFulfillment),
}

impl Fulfillment {
    pub fn eager(data: FulfillmentData) -> Self {
        Self::Eager(data)
    }

    pub async fn content_link(&self) -> CirculationResult<Option<String>> {
        match self {
            Self::Eager(data) => Ok(data.content_link.clone()),
            Self::Deferred(deferred) => deferred.content_link().await,
        }
    }

    pub async fn content_type(&self) -> CirculationResult<Option<String>> {
        match self {
            Self::Eager(data) => Ok(data.content_type.clone()),
            Self::Deferred(deferred) => deferred.content_type().await,
        }
    }

    pub async fn content(&self) -> CirculationResult<Option<String>> {
        match self {
            Self::Eager(data) => Ok(data.content.clone()),
            Self::Deferred(deferred) => deferred.content().await,
        }
    }

    pub async fn content_expires(&self) -> CirculationResult<Option<DateTime<Utc>>> {
        match self {
            Self::Eager(data) => Ok(data.content_expires),
            Self::Deferred(deferred) => deferred.content_expires().await,
        }
    }

    /// リンクまたは本文のどちらかを持つか
    ///
    /// 遅延フルフィルメントの場合、この確認が取得を引き起こす。
    pub async fn has_payload(&self) -> CirculationResult<bool> {
        Ok(self.content_link().await?.is_some() || self.content().await?.is_some())
    }

    /// 標準の描画処理を上書きするレスポンス（なければ None）
    ///
    /// 遅延フルフィルメントは上書きを持たない。
    pub fn as_response(&self) -> Option<&FulfillmentResponse> {
        match self {
            Self::Eager(data) => data.response_override.as_ref(),
            Self::Deferred(_) => None,
        }
    }
}
