use chrono::{DateTime, Utc};

use super::entities::{Hold, LibrarySettings, Patron};
use super::errors::{CirculationError, CirculationResult};
use super::views::LoanView;

/// 純粋関数：利用者が貸出上限に達しているか
///
/// ビジネスルール：
/// - 上限が None または 0 の場合、上限なし（常に false）
/// - オープンアクセスの貸出は数えない（他の利用者を妨げないため）
/// - 無期限貸出（end == None）も数えない
///
/// 副作用なし。
pub fn at_loan_limit(loans: &[LoanView], loan_limit: Option<u32>) -> bool {
    let Some(limit) = effective_limit(loan_limit) else {
        return false;
    };
    let countable = loans
        .iter()
        .filter(|view| !view.open_access && view.loan.end.is_some())
        .count();
    countable >= limit as usize
}

/// 純粋関数：利用者が予約上限に達しているか
///
/// ビジネスルール：
/// - 上限が None または 0 の場合、上限なし（常に false）
/// - 予約はすべて数える（取り置き済みも含む）
///
/// 副作用なし。
pub fn at_hold_limit(hold_count: usize, hold_limit: Option<u32>) -> bool {
    let Some(limit) = effective_limit(hold_limit) else {
        return false;
    };
    hold_count >= limit as usize
}

/// 0 を「無制限」として潰す
fn effective_limit(limit: Option<u32>) -> Option<u32> {
    limit.filter(|&value| value > 0)
}

/// 純粋関数：利用者の貸出資格を確認する
///
/// ビジネスルール：
/// - 認証が期限切れでないこと
/// - 延滞料金が図書館の上限を超えていないこと
/// - ブロックされていないこと
///
/// ベンダー呼び出しより前に必ず評価される。副作用なし。
///
/// # エラー
/// - AuthorizationExpired: 認証が期限切れ
/// - OutstandingFines: 延滞料金が上限超過
/// - AuthorizationBlocked: 利用者がブロック中
pub fn assert_borrowing_privileges(
    patron: &Patron,
    settings: &LibrarySettings,
    now: DateTime<Utc>,
) -> CirculationResult<()> {
    if let Some(expires) = patron.authorization_expires {
        if expires <= now {
            return Err(CirculationError::AuthorizationExpired);
        }
    }

    if let Some(max_fines) = settings.max_outstanding_fines {
        if patron.fines > max_fines {
            return Err(CirculationError::OutstandingFines {
                fines: patron.fines,
                limit: max_fines,
            });
        }
    }

    if let Some(reason) = &patron.block_reason {
        return Err(CirculationError::AuthorizationBlocked {
            reason: reason.clone(),
        });
    }

    Ok(())
}

/// 純粋関数：予約自体が解除可能な位置にあるか
///
/// 待ち行列中（position > 0）は常に解除可能。位置不明（None）も
/// 待ち行列扱いとする。取り置き済み（position == 0）の解除可否は
/// アダプタの capability に委ねられる（呼び出し側で判定）。
pub fn hold_is_revocable(hold: &Hold) -> bool {
    match hold.position {
        None => true,
        Some(position) => position > 0,
    }
}
