#![allow(dead_code)]

use super::entities::{Hold, Loan};
use super::value_objects::{CollectionId, Identifier};

/// 貸出の非正規化ビュー（クエリ用）
///
/// 貸出行に、所属プールのコレクション・書誌識別子・オープンアクセス
/// フラグを付けたもの。貸出上限の判定と蔵書棚同期の突き合わせの
/// 両方がこの形を使う。
#[derive(Debug, Clone)]
pub struct LoanView {
    pub loan: Loan,
    pub collection_id: CollectionId,
    pub identifier: Identifier,
    pub open_access: bool,
}

/// 予約の非正規化ビュー（クエリ用）
#[derive(Debug, Clone)]
pub struct HoldView {
    pub hold: Hold,
    pub collection_id: CollectionId,
    pub identifier: Identifier,
}
