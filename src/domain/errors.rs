#![allow(dead_code)]

use thiserror::Error;

/// 循環管理のエラー分類
///
/// ベンダー固有のエラー条件はアダプタがこの分類へ翻訳して返す。
/// エンジンはこの分類に基づいて、状態への変換（例: AlreadyCheckedOut →
/// プレースホルダ貸出）か、そのままの伝播かを決定する。
/// 上限系のエラーは、HTTP層が詳細を描画できるよう該当する上限値を運ぶ。
#[derive(Debug, Error)]
pub enum CirculationError {
    // ------------------------------------------------------------------
    // 認証・ポリシー
    // ------------------------------------------------------------------
    /// 利用者の認証が期限切れ
    #[error("patron authorization has expired")]
    AuthorizationExpired,

    /// 利用者がブロックされている
    #[error("patron authorization is blocked: {reason}")]
    AuthorizationBlocked { reason: String },

    /// 延滞料金が図書館の上限を超えている
    #[error("patron has {fines} in outstanding fines (limit: {limit})")]
    OutstandingFines { fines: f64, limit: f64 },

    /// 貸出上限に達している
    #[error("patron is at their loan limit ({limit})")]
    PatronLoanLimitReached { limit: u32 },

    /// 予約上限に達している
    #[error("patron is at their hold limit ({limit})")]
    PatronHoldLimitReached { limit: u32 },

    // ------------------------------------------------------------------
    // 貸出・更新
    // ------------------------------------------------------------------
    /// この書籍は既に貸出中
    #[error("this book is already checked out to you")]
    AlreadyCheckedOut,

    /// この書籍は既に予約済み
    #[error("you already have this book on hold")]
    AlreadyOnHold,

    /// 書籍が現在貸出可能（予約は不要）
    #[error("this book is currently available, a hold is not needed")]
    CurrentlyAvailable,

    /// 貸出可能な複製がない
    #[error("no copies of this book are currently available")]
    NoAvailableCopies,

    /// ライセンス自体が存在しない
    #[error("this collection has no licenses for this book")]
    NoLicenses,

    /// 貸出を更新できない
    #[error("cannot renew loan: {reason}")]
    CannotRenew { reason: String },

    /// 貸出ができない
    #[error("cannot loan: {reason}")]
    CannotLoan { reason: String },

    /// この操作には配信方式の指定が必須
    #[error("you must specify a delivery mechanism to borrow this book")]
    DeliveryMechanismMissing,

    /// この図書館では予約が許可されていない
    #[error("holds are not permitted in this library")]
    HoldsNotPermitted,

    /// 予約ができない
    #[error("cannot place hold: {reason}")]
    CannotHold { reason: String },

    // ------------------------------------------------------------------
    // フルフィルメント
    // ------------------------------------------------------------------
    /// 有効な貸出が見つからない
    #[error("cannot find your active loan for this work")]
    NoActiveLoan,

    /// フルフィルメントができない
    #[error("cannot fulfill loan: {reason}")]
    CannotFulfill { reason: String },

    /// ベンダーが本文もリンクも返さなかった
    #[error("could not retrieve this book in an acceptable format")]
    NoAcceptableFormat,

    /// 要求されたフォーマットが提供できない
    #[error("the requested format is not available")]
    FormatNotAvailable,

    /// 既に確定済みの配信方式と非互換
    #[error("loan is already fulfilled as {held}, it cannot also be fulfilled as {requested}")]
    DeliveryMechanismConflict { held: String, requested: String },

    /// 配信方式をベンダー内部フォーマットへ対応付けできない
    #[error("could not map delivery mechanism to an internal format: {reason}")]
    DeliveryMechanismError { reason: String },

    // ------------------------------------------------------------------
    // 返却・予約解除
    // ------------------------------------------------------------------
    /// リモートでは貸出が存在しない（返却時は黙って回復される）
    #[error("this book is not checked out to you")]
    NotCheckedOut,

    /// リモートでは予約が存在しない（解除時は黙って回復される）
    #[error("this book is not on hold for you")]
    NotOnHold,

    /// 返却ができない
    #[error("cannot return: {reason}")]
    CannotReturn { reason: String },

    /// 予約解除ができない
    #[error("cannot release hold: {reason}")]
    CannotReleaseHold { reason: String },

    // ------------------------------------------------------------------
    // インフラ
    // ------------------------------------------------------------------
    /// ベンダー側のサーバーエラー
    #[error("remote service {service} returned a server error: {reason}")]
    RemoteInitiatedServerError { service: String, reason: String },

    /// アダプタ構築時の設定エラー
    ///
    /// エンジン構築時には送出されず、レジストリに保存される。
    #[error("adapter configuration error: {reason}")]
    ConfigurationError { reason: String },

    /// このアダプタは利用者アクティビティの取得に対応していない
    #[error("this adapter cannot report patron activity")]
    PatronActivityUnsupported,

    /// 利用者が見つからない
    #[error("patron not found")]
    PatronNotFound,

    /// 図書館が見つからない
    #[error("library not found")]
    LibraryNotFound,

    /// ライセンスプールが見つからない
    #[error("license pool not found")]
    PoolNotFound,

    /// 配信方式が見つからない
    #[error("delivery mechanism not found")]
    MechanismNotFound,

    /// ストアポートのI/Oエラー
    #[error("circulation store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CirculationError {
    /// ストアポートのエラーをラップする
    pub fn store(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Store(err)
    }
}

/// 循環管理の Result型
pub type CirculationResult<T> = std::result::Result<T, CirculationError>;
