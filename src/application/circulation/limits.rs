use crate::domain::entities::{LicensePool, Patron};
use crate::domain::errors::{CirculationError, CirculationResult};
use crate::domain::policy;

use super::registry::CirculationDeps;

/// 図書館ごとの貸出・予約上限を強制する
///
/// ベンダー呼び出しの**前**に評価されるポリシーゲート。
///
/// ビジネスルール：
/// 1. オープンアクセス・無制限アクセスのプールは上限の対象外
/// 2. 貸出上限・予約上限のどちらにも達していなければ通す
/// 3. 両方に達していれば PatronLoanLimitReached
///    （利用者に最も伝わりやすいメッセージを選ぶ）
/// 4. 片方だけの場合は在庫を更新してから判定する：
///    - 複製が貸出可能で貸出上限に達している → PatronLoanLimitReached
///    - 複製がなく予約上限に達している → PatronHoldLimitReached
///    - それ以外（例：貸出上限だが在庫なし → 予約は可能）は通す
///
/// 在庫の更新はレース（貸出だと思っていたら予約になる等）の窓を
/// 狭めるために行う。副作用としてプールの複製数が最新化される。
///
/// # エラー
/// - PatronLoanLimitReached / PatronHoldLimitReached: 上限値を運ぶ
/// - Store / ベンダー由来のエラー: そのまま伝播
pub async fn enforce_limits(
    deps: &CirculationDeps,
    patron: &Patron,
    pool: &LicensePool,
) -> CirculationResult<()> {
    if pool.open_access || pool.unlimited_access {
        return Ok(());
    }

    let settings = &deps.library.settings;
    let loans = deps
        .store
        .patron_loans(patron.id)
        .await
        .map_err(CirculationError::store)?;
    let holds = deps
        .store
        .patron_holds(patron.id)
        .await
        .map_err(CirculationError::store)?;

    let at_loan_limit = policy::at_loan_limit(&loans, settings.loan_limit);
    let at_hold_limit = policy::at_hold_limit(holds.len(), settings.hold_limit);

    if !at_loan_limit && !at_hold_limit {
        return Ok(());
    }

    if at_loan_limit && at_hold_limit {
        return Err(CirculationError::PatronLoanLimitReached {
            limit: settings.loan_limit.unwrap_or_default(),
        });
    }

    // ここで最新の在庫情報を取らないと、予約になるはずの書籍へ
    // 貸出上限を適用してしまうことがある
    if let Some(api) = deps.adapter_for(pool) {
        api.update_availability(pool).await?;
    }
    let pool = deps
        .store
        .license_pool(pool.id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PoolNotFound)?;

    let currently_available = pool.licenses_available > 0;
    if currently_available && at_loan_limit {
        return Err(CirculationError::PatronLoanLimitReached {
            limit: settings.loan_limit.unwrap_or_default(),
        });
    }
    if !currently_available && at_hold_limit {
        return Err(CirculationError::PatronHoldLimitReached {
            limit: settings.hold_limit.unwrap_or_default(),
        });
    }

    Ok(())
}
