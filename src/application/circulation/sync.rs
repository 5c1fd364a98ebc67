use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future;

use crate::domain::commands::SyncBookshelf;
use crate::domain::entities::{Hold, Loan, Patron};
use crate::domain::errors::{CirculationError, CirculationResult};
use crate::domain::records::{ActivityItem, HoldActivity, LoanActivity};
use crate::domain::reconcile;
use crate::domain::value_objects::CollectionId;

use super::registry::CirculationDeps;

/// アダプタ1件あたりの `patron_activity` 呼び出しタイムアウト
///
/// ベンダー呼び出しはI/Oバウンドで数秒間ブロックしうる。タイムアウトは
/// 例外と同じ扱いになり、その同期は不完全（complete = false）となる。
const PATRON_ACTIVITY_TIMEOUT_SECS: u64 = 30;

/// 利用者の貸出・予約を全ベンダーから並行取得する
///
/// `patron_activity` 対応の全アダプタへ1タスクずつ割り当てて同時に
/// 問い合わせ、全タスクの完了を待ってから結果をまとめる。タスク間に
/// 順序の保証はない。
///
/// 1つでも失敗（エラー・タイムアウト・パニック）したタスクがあれば
/// `complete == false` となり、呼び出し側は削除を伴う処理を行っては
/// ならない。失敗の内容はログに記録され、呼び出し側へは返さない。
pub async fn patron_activity(
    deps: &CirculationDeps,
    patron: &Patron,
    pin: &str,
) -> (Vec<LoanActivity>, Vec<HoldActivity>, bool) {
    let started = Instant::now();
    let mut handles = Vec::new();
    for collection_id in &deps.sync_collection_ids {
        let Some(api) = deps.adapter_for_collection(*collection_id) else {
            continue;
        };
        let patron = patron.clone();
        let pin = pin.to_string();
        handles.push(tokio::spawn(async move {
            let task_started = Instant::now();
            let outcome = tokio::time::timeout(
                Duration::from_secs(PATRON_ACTIVITY_TIMEOUT_SECS),
                api.patron_activity(&patron, &pin),
            )
            .await;
            (api.collection_id(), task_started.elapsed(), outcome)
        }));
    }

    // 全タスクの完了を待ってから結果をまとめる
    let mut loans = Vec::new();
    let mut holds = Vec::new();
    let mut complete = true;
    for joined in future::join_all(handles).await {
        match joined {
            Ok((collection, elapsed, Ok(Ok(items)))) => {
                tracing::debug!(
                    collection = collection.value(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "synced patron activity"
                );
                for item in items {
                    match item {
                        ActivityItem::Loan(loan) => loans.push(loan),
                        ActivityItem::Hold(hold) => holds.push(hold),
                    }
                }
            }
            Ok((collection, _, Ok(Err(error)))) => {
                // 失敗したアダプタがあると利用者の貸出の全体像が得られない
                complete = false;
                tracing::error!(
                    collection = collection.value(),
                    %error,
                    "patron activity sync errored out"
                );
            }
            Ok((collection, elapsed, Err(_))) => {
                complete = false;
                tracing::error!(
                    collection = collection.value(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "patron activity sync timed out"
                );
            }
            Err(join_error) => {
                complete = false;
                tracing::error!(%join_error, "patron activity task failed to complete");
            }
        }
    }
    tracing::debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        complete,
        "full patron activity sync finished"
    );
    (loans, holds, complete)
}

/// 蔵書棚同期：ローカルの貸出・予約をベンダー側の真実と突き合わせる
///
/// 処理フロー：
/// 1. 鮮度ゲート：`last_loan_activity_sync` が有効で `force` でなければ
///    ローカルのキャッシュをそのまま返す（ベンダー呼び出しなし）。
///    TTLの判定は呼び出し側の責務であり、この関数はスタンプを信用する
/// 2. ベンダー問い合わせ開始**直前**の時刻を控える（スタンプは保守的に。
///    同期中にベンダー側で状態が変わっても次回の同期が拾える）
/// 3. 全アダプタへ並行問い合わせ
/// 4. 純粋な突き合わせ計画を作り、ストアが単一トランザクションで反映する。
///    不完全な同期では追加・更新のみ行い、削除は一切行わない
/// 5. スタンプを設定（不完全なら None = 次回同期を強制）
pub async fn sync_bookshelf(
    deps: &CirculationDeps,
    cmd: SyncBookshelf,
) -> CirculationResult<(Vec<Loan>, Vec<Hold>)> {
    let patron = deps
        .store
        .patron(cmd.patron_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PatronNotFound)?;
    sync_patron_bookshelf(deps, &patron, &cmd.pin, cmd.force).await
}

/// 読み込み済みの利用者スナップショットに対する蔵書棚同期
///
/// borrow / fulfill の内部からも使われる。
pub async fn sync_patron_bookshelf(
    deps: &CirculationDeps,
    patron: &Patron,
    pin: &str,
    force: bool,
) -> CirculationResult<(Vec<Loan>, Vec<Hold>)> {
    let sync_collections: HashSet<CollectionId> =
        deps.sync_collection_ids.iter().copied().collect();

    let local_loans = deps
        .store
        .patron_loans(patron.id)
        .await
        .map_err(CirculationError::store)?;
    let local_holds = deps
        .store
        .patron_holds(patron.id)
        .await
        .map_err(CirculationError::store)?;

    // 1. 鮮度ゲート
    if patron.last_loan_activity_sync.is_some() && !force {
        let loans = local_loans
            .into_iter()
            .filter(|view| sync_collections.contains(&view.collection_id))
            .map(|view| view.loan)
            .collect();
        let holds = local_holds
            .into_iter()
            .filter(|view| sync_collections.contains(&view.collection_id))
            .map(|view| view.hold)
            .collect();
        return Ok((loans, holds));
    }

    // 2. 問い合わせ開始直前の時刻（すべて成功した場合のスタンプ）
    let sync_started = Utc::now();

    // 3. 並行ファンアウト
    let (remote_loans, remote_holds, complete) = patron_activity(deps, patron, pin).await;

    // 4. 突き合わせ計画の作成と反映
    let stamp = if complete { Some(sync_started) } else { None };
    let plan = reconcile::plan(
        &local_loans,
        &local_holds,
        &remote_loans,
        &remote_holds,
        complete,
        Utc::now(),
        &sync_collections,
    );
    if !plan.delete_loans.is_empty() || !plan.delete_holds.is_empty() {
        tracing::info!(
            patron = %patron.authorization_identifier,
            loans = plan.delete_loans.len(),
            holds = plan.delete_holds.len(),
            "deleting local rows the vendors no longer report"
        );
    }
    let (loans, holds) = deps
        .store
        .apply_reconciliation(patron.id, plan, stamp)
        .await
        .map_err(CirculationError::store)?;

    Ok((loans, holds))
}
