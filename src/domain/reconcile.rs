use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use super::records::{DeliveryMechanismInfo, HoldActivity, LoanActivity};
use super::value_objects::{CollectionId, HoldId, Identifier, LoanId};
use super::views::{HoldView, LoanView};

/// 借用直後の貸出を同期の刈り取りから守る猶予
///
/// 並行する borrow の最中に同期が走った場合、リモート一覧に
/// まだ現れない新規貸出を誤って削除しないための保護期間。
const RECENT_LOAN_GRACE_SECONDS: i64 = 60;

/// 貸出1件の反映指示
///
/// `existing == Some` なら既存行の更新（start / end は Some の場合のみ
/// 上書き）。`existing == None` なら、(data_source, identifier, collection)
/// でライセンスプールを解決（なければ作成）した上で新規作成する。
#[derive(Debug, Clone)]
pub struct LoanReconciliation {
    pub existing: Option<LoanId>,
    pub collection_id: CollectionId,
    pub data_source: String,
    pub identifier: Identifier,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub external_identifier: Option<String>,
    /// リモートが報告した束縛済み配信方式（あれば貸出へ適用する）
    pub locked_to: Option<DeliveryMechanismInfo>,
}

/// 予約1件の反映指示
///
/// start / end は Some の場合のみ上書き。position はリモートの値を
/// そのまま反映する（None は「不明」として保存する）。
#[derive(Debug, Clone)]
pub struct HoldReconciliation {
    pub existing: Option<HoldId>,
    pub collection_id: CollectionId,
    pub data_source: String,
    pub identifier: Identifier,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub position: Option<u32>,
    pub external_identifier: Option<String>,
}

/// 蔵書棚同期の反映計画
///
/// ストアはこの計画を単一のネストトランザクションで実行する。
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    pub loan_upserts: Vec<LoanReconciliation>,
    pub hold_upserts: Vec<HoldReconciliation>,
    pub delete_loans: Vec<LoanId>,
    pub delete_holds: Vec<HoldId>,
}

impl ReconciliationPlan {
    /// 計画が何も変更しないか
    pub fn is_empty(&self) -> bool {
        self.loan_upserts.is_empty()
            && self.hold_upserts.is_empty()
            && self.delete_loans.is_empty()
            && self.delete_holds.is_empty()
    }
}

/// 純粋関数：ローカルとリモートの蔵書棚を突き合わせ、反映計画を作る
///
/// ビジネスルール：
/// - リモートの貸出・予約はローカルへ追加または更新される（リモートが真）
/// - リモートに現れなかったローカル行の削除は `complete == true` の
///   場合に限る（到達できなかったアダプタが知っている貸出を誤って
///   捨てないため）
/// - 削除対象でも、開始が直近1分以内の貸出は刈り取らない
///   （並行 borrow の保護）。開始不明の貸出は刈り取る
/// - 管理対象コレクション以外のローカル行には一切触れない
///
/// 突き合わせキーは書誌識別子 (identifier_type, identifier)。
/// コレクション未解決のリモートレコードは、対応するローカル行の保護
/// （削除対象からの除外）のみ行い、作成はしない。
///
/// 副作用なし。計画の実行はストアが担う。
pub fn plan(
    local_loans: &[LoanView],
    local_holds: &[HoldView],
    remote_loans: &[LoanActivity],
    remote_holds: &[HoldActivity],
    complete: bool,
    now: DateTime<Utc>,
    sync_collections: &HashSet<CollectionId>,
) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan::default();

    // 1. ローカル行を識別子でインデックス化（管理対象コレクションのみ）
    let mut loans_by_identifier: HashMap<Identifier, &LoanView> = local_loans
        .iter()
        .filter(|view| sync_collections.contains(&view.collection_id))
        .map(|view| (view.identifier.clone(), view))
        .collect();
    let mut holds_by_identifier: HashMap<Identifier, &HoldView> = local_holds
        .iter()
        .filter(|view| sync_collections.contains(&view.collection_id))
        .map(|view| (view.identifier.clone(), view))
        .collect();

    // 2. リモートの貸出を反映指示へ変換し、ローカル行をチェックオフ
    for remote in remote_loans {
        let local = loans_by_identifier.remove(&remote.source.identifier);
        let collection_id = match (local, remote.source.collection_id) {
            (Some(view), _) => view.collection_id,
            (None, Some(collection_id)) => collection_id,
            // コレクション未解決かつローカルにも存在しない：作成できない
            (None, None) => continue,
        };
        plan.loan_upserts.push(LoanReconciliation {
            existing: local.map(|view| view.loan.id),
            collection_id,
            data_source: remote.source.data_source_name.clone(),
            identifier: remote.source.identifier.clone(),
            start: remote.start_date,
            end: remote.end_date,
            external_identifier: remote.external_identifier.clone(),
            locked_to: remote.locked_to.clone(),
        });
    }

    // 3. リモートの予約も同様
    for remote in remote_holds {
        let local = holds_by_identifier.remove(&remote.source.identifier);
        let collection_id = match (local, remote.source.collection_id) {
            (Some(view), _) => view.collection_id,
            (None, Some(collection_id)) => collection_id,
            (None, None) => continue,
        };
        plan.hold_upserts.push(HoldReconciliation {
            existing: local.map(|view| view.hold.id),
            collection_id,
            data_source: remote.source.data_source_name.clone(),
            identifier: remote.source.identifier.clone(),
            start: remote.start_date,
            end: remote.end_date,
            position: remote.hold_position,
            external_identifier: remote.external_identifier.clone(),
        });
    }

    // 4. 削除は完全な同期ができた場合のみ
    if complete {
        let grace_cutoff = now - Duration::seconds(RECENT_LOAN_GRACE_SECONDS);
        for view in loans_by_identifier.into_values() {
            // 直近に始まった貸出は、並行 borrow の産物かもしれないので残す
            let started_recently = view
                .loan
                .start
                .is_some_and(|start| start >= grace_cutoff);
            if !started_recently {
                plan.delete_loans.push(view.loan.id);
            }
        }
        for view in holds_by_identifier.into_values() {
            plan.delete_holds.push(view.hold.id);
        }
    }

    plan
}
