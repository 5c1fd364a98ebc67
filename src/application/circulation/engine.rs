use chrono::{Duration, Utc};

use crate::domain::commands::{BorrowBook, FulfillBook, ReleaseHold, RevokeLoan};
use crate::domain::entities::{
    Hold, LicensePool, LicensePoolDeliveryMechanism, Loan, Patron,
};
use crate::domain::errors::{CirculationError, CirculationResult};
use crate::domain::events::{CirculationEvent, CirculationEventType};
use crate::domain::fulfillment::{Fulfillment, FulfillmentData};
use crate::domain::policy;
use crate::domain::records::{CheckoutOutcome, CirculationSource, HoldActivity, LoanActivity};
use crate::domain::value_objects::{LibraryId, PatronId};
use crate::ports::circulation_store::{HoldCommit, LoanCommit};
use crate::ports::vendor_adapter::DeliveryMechanismStep;

use super::limits::enforce_limits;
use super::registry::CirculationDeps;
use super::sync::sync_patron_bookshelf;

/// AlreadyCheckedOut 時に合成するプレースホルダ貸出の期限
///
/// 実際の開始・終了時刻は次回の蔵書棚同期で判明する。
const PLACEHOLDER_LOAN_HOURS: i64 = 1;

/// リクエストコンテキスト
///
/// 現在のリクエストで認証された利用者と図書館。分析イベントの帰属にのみ
/// 使われる。リクエストの外（バッチ等）から呼ぶ場合は anonymous を渡す。
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub patron_id: Option<PatronId>,
    /// 認証済み利用者の地区情報（ILS由来）
    pub patron_neighborhood: Option<String>,
    pub library_id: Option<LibraryId>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_patron(patron: &Patron) -> Self {
        Self {
            patron_id: Some(patron.id),
            patron_neighborhood: patron.neighborhood.clone(),
            library_id: Some(patron.library_id),
        }
    }
}

/// 書籍を借りる。借りられなければ予約する
///
/// フルフィルメントのことはまだ気にしない。
///
/// 戻り値は (貸出, 予約, 新規か) の3つ組で、貸出と予約のちょうど一方が
/// Some となる。
///
/// 処理フロー：
/// 1. 利用者の資格確認（ベンダー呼び出しの前。期限切れ・延滞料金・
///    ブロックのいずれかで即座に打ち切る）
/// 2. アダプタ解決。なければ NoLicenses
/// 3. 貸出時点で配信方式の確定が必要なアダプタなら、指定がないことを
///    DeliveryMechanismMissing として弾く
/// 4. ローカルに既存貸出があり、かつアダプタが同期可能なら、強制同期で
///    「ローカルが古いだけ」なのか「本当の更新（renewal）」なのかを
///    見分けてから進む
/// 5. 図書館の貸出・予約上限を強制する
/// 6. checkout を試み、結果・エラーを下表に従って解釈する：
///    - LoanActivity → 新規貸出として扱う
///    - HoldActivity → ベンダーが予約へ格下げした
///    - AlreadyCheckedOut → 期限 now+1h のプレースホルダ貸出を合成
///    - AlreadyOnHold → 位置不明の予約を合成
///    - NoAvailableCopies（既存貸出あり）→ CannotRenew
///    - NoAvailableCopies（なし）→ 在庫を更新して予約へ進む
///    - NoLicenses → 在庫を更新して再送出
///    - PatronLoanLimitReached → 覚えておき、予約へ進む。予約が
///      CurrentlyAvailable で失敗したらこちらを再送出する
///      （利用者がやろうとしたのは予約ではなく貸出なので、正直な
///      説明は貸出上限のほう）
/// 7. 貸出が得られたら原子的に upsert（既存予約の削除を含む）し、
///    コミット後に CheckOut イベントを送出する
/// 8. そうでなければ予約を試み、原子的に upsert（既存貸出の削除を含む）
///    し、新規ならコミット後に HoldPlace イベントを送出する
pub async fn borrow(
    deps: &CirculationDeps,
    ctx: &RequestContext,
    cmd: BorrowBook,
) -> CirculationResult<(Option<Loan>, Option<Hold>, bool)> {
    let now = Utc::now();

    // 1. 資格確認
    let patron = deps
        .store
        .patron(cmd.patron_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PatronNotFound)?;
    policy::assert_borrowing_privileges(&patron, &deps.library.settings, now)?;

    // 2. アダプタ解決
    let pool = deps
        .store
        .license_pool(cmd.license_pool_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PoolNotFound)?;
    let api = deps.adapter_for(&pool).ok_or(CirculationError::NoLicenses)?;
    let capabilities = api.capabilities();

    // 3. 配信方式の必須チェック
    let must_set_delivery_mechanism =
        capabilities.set_delivery_mechanism_at == DeliveryMechanismStep::Borrow;
    if must_set_delivery_mechanism && cmd.delivery_mechanism.is_none() {
        return Err(CirculationError::DeliveryMechanismMissing);
    }
    let delivery_mechanism = match cmd.delivery_mechanism {
        Some(id) => Some(
            deps.store
                .delivery_mechanism(id)
                .await
                .map_err(CirculationError::store)?
                .ok_or(CirculationError::MechanismNotFound)?,
        ),
        None => None,
    };

    // 4. 既存貸出の確認。あれば強制同期で「古いローカル状態」と
    //    「本当の更新」を見分ける
    let mut existing_loan = deps
        .store
        .loan_for(patron.id, pool.id)
        .await
        .map_err(CirculationError::store)?;
    if existing_loan.is_some() && capabilities.supports_patron_activity {
        sync_patron_bookshelf(deps, &patron, &cmd.pin, true).await?;
        existing_loan = deps
            .store
            .loan_for(patron.id, pool.id)
            .await
            .map_err(CirculationError::store)?;
    }

    // 5. ポリシーゲート
    enforce_limits(deps, &patron, &pool).await?;

    // 書籍が借りられないと思っていても checkout は試みる。直前に誰かが
    // 返却しているかもしれない
    let mut loan_activity: Option<LoanActivity> = None;
    let mut hold_activity: Option<HoldActivity> = None;
    let mut vendor_loan_is_new = false;

    // checkout が失敗しても実際には予約で満たせる場合がある。
    // その場合に備えて例外を覚えておき、予約まで失敗したときに
    // どちらを返すかを判断する
    let mut loan_exception: Option<CirculationError> = None;

    // 6. checkout 試行と結果の解釈
    match api
        .checkout(&patron, &cmd.pin, &pool, delivery_mechanism.as_ref())
        .await
    {
        Ok(CheckoutOutcome::Loan(info)) => {
            loan_activity = Some(info);
            vendor_loan_is_new = true;
        }
        Ok(CheckoutOutcome::Hold(info)) => {
            // ベンダーは貸出を作れず、エラーの代わりに予約を返した
            hold_activity = Some(info);
        }
        Err(CirculationError::AlreadyCheckedOut) => {
            // 貸出は存在するが本当の貸出情報は得られなかった。
            // プレースホルダを合成し、次回同期に任せる
            let mut info = LoanActivity::new(
                source_for(&pool),
                None,
                Some(now + Duration::hours(PLACEHOLDER_LOAN_HOURS)),
            );
            if let Some(existing) = &existing_loan {
                info.external_identifier = existing.external_identifier.clone();
            }
            loan_activity = Some(info);
        }
        Err(CirculationError::AlreadyOnHold) => {
            // 既に予約済みの書籍を借りようとした。位置は不明のまま合成する
            hold_activity = Some(HoldActivity::new(source_for(&pool), None, None, None));
        }
        Err(CirculationError::NoAvailableCopies) => {
            if existing_loan.is_some() {
                // 更新（renewal）しようとしたが、返却待ちの利用者がいる
                return Err(CirculationError::CannotRenew {
                    reason: "other patrons have this work on hold".to_string(),
                });
            }
            // 利用者は在庫があると誤信していた。在庫を直して予約へ進む
            api.update_availability(&pool).await?;
        }
        Err(error @ CirculationError::NoLicenses) => {
            api.update_availability(&pool).await?;
            return Err(error);
        }
        Err(error @ CirculationError::PatronLoanLimitReached { .. }) => {
            // サーバー側の上限は通ったが、ベンダー側の貸出上限に当たった。
            // 書籍が借りられない状態なら予約で満たせるので、まず試す
            loan_exception = Some(error);
        }
        Err(other) => return Err(other),
    }

    // 7. 貸出が成立した場合
    if let Some(info) = loan_activity {
        let commit = LoanCommit {
            start: Some(info.start_date.unwrap_or(now)),
            end: info.end_date,
            external_identifier: info.external_identifier.clone(),
            fulfillment: if must_set_delivery_mechanism {
                cmd.delivery_mechanism
            } else {
                None
            },
        };
        let (loan, row_is_new) = deps
            .store
            .commit_loan(patron.id, pool.id, commit)
            .await
            .map_err(CirculationError::store)?;
        let is_new = vendor_loan_is_new || row_is_new;
        if is_new {
            collect_event(
                deps,
                ctx,
                Some(&patron),
                Some(&pool),
                CirculationEventType::CheckOut,
                true,
            )
            .await;
        }
        return Ok((Some(loan), None, is_new));
    }

    // この時点で、貸出の成立も既存貸出の発見もしていない。
    // 予約で満たせるか試す

    // 8. 予約へのフォールバック
    if !deps.library.settings.allow_holds {
        return Err(loan_exception.unwrap_or(CirculationError::HoldsNotPermitted));
    }
    let info = match hold_activity {
        Some(info) => info,
        None => {
            let notification_email = cmd
                .hold_notification_email
                .clone()
                .or_else(|| default_notification_email_address(deps));
            match api
                .place_hold(&patron, &cmd.pin, &pool, notification_email.as_deref())
                .await
            {
                Ok(info) => info,
                Err(CirculationError::AlreadyOnHold) => {
                    HoldActivity::new(source_for(&pool), None, None, None)
                }
                Err(error @ CirculationError::CurrentlyAvailable) => {
                    if let Some(deferred) = loan_exception {
                        // 貸出が例外で失敗し、予約は「書籍が借りられる」という
                        // 理由で失敗した。つまり最初の例外が本当の問題だった
                        return Err(deferred);
                    }
                    return Err(error);
                }
                Err(other) => return Err(other),
            }
        }
    };

    // 9. 予約をDBへ
    let commit = HoldCommit {
        start: Some(info.start_date.unwrap_or(now)),
        end: info.end_date,
        position: info.hold_position,
        external_identifier: info.external_identifier.clone(),
    };
    let (hold, is_new) = deps
        .store
        .commit_hold(patron.id, pool.id, commit)
        .await
        .map_err(CirculationError::store)?;
    if is_new {
        collect_event(
            deps,
            ctx,
            Some(&patron),
            Some(&pool),
            CirculationEventType::HoldPlace,
            false,
        )
        .await;
    }
    Ok((None, Some(hold), is_new))
}

/// 貸出済みの書籍をフルフィルする
///
/// 処理フロー：
/// 1. ローカルの貸出を引く
/// 2. 貸出がなく、貸出なしフルフィルも許されない場合：
///    同期可能なら1回だけ同期して再試行し、それでもなければ NoActiveLoan
/// 3. 貸出が既に別の配信方式へ束縛済みで、要求と非互換なら
///    DeliveryMechanismConflict（1つの貸出を複数のDRM方式に
///    またがらせることはできない）
/// 4. オープンアクセスのプールはアダプタを介さず LPDM のリソースから
///    直接フルフィルメントを作る。それ以外はアダプタへ委譲する
/// 5. リンクも本文も持たない結果は NoAcceptableFormat
/// 6. 貸出が存在し、配信方式が未確定で、選ばれた方式がストリーミングで
///    なければ、方式を貸出へ記録する（ストリーミングは束縛しない）
/// 7. コミット後に Fulfill イベントを送出する（地区情報つき）
pub async fn fulfill(
    deps: &CirculationDeps,
    ctx: &RequestContext,
    cmd: FulfillBook,
) -> CirculationResult<Fulfillment> {
    let patron = deps
        .store
        .patron(cmd.patron_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PatronNotFound)?;
    let pool = deps
        .store
        .license_pool(cmd.license_pool_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PoolNotFound)?;
    let lpdm = deps
        .store
        .delivery_mechanism(cmd.delivery_mechanism)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::MechanismNotFound)?;

    let mut sync_allowed = cmd.sync_on_failure;
    loop {
        let loan = deps
            .store
            .loan_for(patron.id, pool.id)
            .await
            .map_err(CirculationError::store)?;

        // 1-2. 貸出なしの扱い
        if loan.is_none()
            && !can_fulfill_without_loan(deps, Some(&patron), Some(&pool), Some(&lpdm)).await
        {
            let adapter_syncs = deps
                .adapter_for(&pool)
                .map(|api| api.capabilities().supports_patron_activity)
                .unwrap_or(false);
            if sync_allowed && adapter_syncs {
                // 同期してからもう一度だけ試す
                sync_patron_bookshelf(deps, &patron, &cmd.pin, true).await?;
                sync_allowed = false;
                continue;
            }
            return Err(CirculationError::NoActiveLoan);
        }

        // 3. DRM方式の競合チェック
        if let Some(loan) = &loan {
            if let Some(held_id) = loan.fulfillment_id {
                if held_id != lpdm.id {
                    let held = deps
                        .store
                        .delivery_mechanism(held_id)
                        .await
                        .map_err(CirculationError::store)?;
                    if let Some(held) = held {
                        if !held.mechanism.compatible_with(&lpdm.mechanism) {
                            return Err(CirculationError::DeliveryMechanismConflict {
                                held: describe_mechanism(&held),
                                requested: describe_mechanism(&lpdm),
                            });
                        }
                    }
                }
            }
        }

        // 4. フルフィルメントの取得
        let fulfillment = if pool.open_access {
            open_access_fulfillment(&pool, &lpdm)?
        } else {
            let api = deps
                .adapter_for(&pool)
                .ok_or_else(|| CirculationError::CannotFulfill {
                    reason: "no adapter for this collection".to_string(),
                })?;
            api.fulfill(&patron, &cmd.pin, &pool, &lpdm).await?
        };

        // 5. ペイロードの確認（遅延フルフィルメントはここで取得が走る）
        if !fulfillment.has_payload().await? {
            return Err(CirculationError::NoAcceptableFormat);
        }

        // 6. 選ばれた配信方式を貸出へ記録
        if let Some(loan) = &loan {
            if loan.fulfillment_id.is_none() && !lpdm.mechanism.is_streaming() {
                deps.store
                    .set_loan_fulfillment(loan.id, lpdm.id)
                    .await
                    .map_err(CirculationError::store)?;
            }
        }

        // 7. 分析イベント
        collect_event(
            deps,
            ctx,
            Some(&patron),
            Some(&pool),
            CirculationEventType::Fulfill,
            true,
        )
        .await;

        return Ok(fulfillment);
    }
}

/// 貸出を取り消す（返却）
///
/// リモートが NotCheckedOut を返した場合は黙って回復する。ローカルと
/// リモートの食い違いは利用者に有利な側へ倒す（どのみち行は消す）。
/// それ以外のエラーはそのまま伝播する。
pub async fn revoke_loan(
    deps: &CirculationDeps,
    ctx: &RequestContext,
    cmd: RevokeLoan,
) -> CirculationResult<bool> {
    let patron = deps
        .store
        .patron(cmd.patron_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PatronNotFound)?;
    let pool = deps
        .store
        .license_pool(cmd.license_pool_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PoolNotFound)?;

    let loan = deps
        .store
        .loan_for(patron.id, pool.id)
        .await
        .map_err(CirculationError::store)?;
    if let Some(loan) = loan {
        let Some(api) = deps.adapter_for(&pool) else {
            tracing::error!(
                patron = %patron.authorization_identifier,
                pool = %pool.identifier.identifier,
                "tried to revoke loan but no adapter was found"
            );
            return Err(CirculationError::CannotReturn {
                reason: "no adapter for this collection".to_string(),
            });
        };
        match api.checkin(&patron, &cmd.pin, &pool).await {
            Ok(()) => {}
            // そもそも貸出がなかった。問題ない
            Err(CirculationError::NotCheckedOut) => {}
            Err(other) => return Err(other),
        }

        tracing::info!(loan = %loan.id.value(), "deleting loan on revoke");
        deps.store
            .delete_loan(patron.id, pool.id)
            .await
            .map_err(CirculationError::store)?;

        collect_event(
            deps,
            ctx,
            Some(&patron),
            Some(&pool),
            CirculationEventType::CheckIn,
            false,
        )
        .await;
    }
    Ok(true)
}

/// 予約を解除する
///
/// リモートが NotOnHold を返した場合は黙って回復する。
pub async fn release_hold(
    deps: &CirculationDeps,
    ctx: &RequestContext,
    cmd: ReleaseHold,
) -> CirculationResult<bool> {
    let patron = deps
        .store
        .patron(cmd.patron_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PatronNotFound)?;
    let pool = deps
        .store
        .license_pool(cmd.license_pool_id)
        .await
        .map_err(CirculationError::store)?
        .ok_or(CirculationError::PoolNotFound)?;

    let hold = deps
        .store
        .hold_for(patron.id, pool.id)
        .await
        .map_err(CirculationError::store)?;
    let api = deps
        .adapter_for(&pool)
        .ok_or_else(|| CirculationError::CannotReleaseHold {
            reason: "no adapter for this collection".to_string(),
        })?;
    match api.release_hold(&patron, &cmd.pin, &pool).await {
        Ok(()) => {}
        // そもそも予約がなかった。問題ない
        Err(CirculationError::NotOnHold) => {}
        Err(other) => return Err(other),
    }

    if hold.is_some() {
        deps.store
            .delete_hold(patron.id, pool.id)
            .await
            .map_err(CirculationError::store)?;
        collect_event(
            deps,
            ctx,
            Some(&patron),
            Some(&pool),
            CirculationEventType::HoldRelease,
            false,
        )
        .await;
    }
    Ok(true)
}

/// この予約はいま解除できるか
///
/// 待ち行列中（または位置不明）の予約は常に解除できる。取り置き済み
/// （position == 0）の予約は、アダプタが取り置き後の解除を許す場合のみ。
pub fn can_revoke_hold(deps: &CirculationDeps, pool: &LicensePool, hold: &Hold) -> bool {
    if policy::hold_is_revocable(hold) {
        return true;
    }
    deps.adapter_for(pool)
        .map(|api| api.capabilities().can_revoke_hold_when_reserved)
        .unwrap_or(false)
}

/// 貸出なしでこの書籍をこの方式で配信できるか
///
/// 原則として不可だが、オープンアクセスのプールと、一部の配信モデルの
/// アダプタは許可する。
pub async fn can_fulfill_without_loan(
    deps: &CirculationDeps,
    patron: Option<&Patron>,
    pool: Option<&LicensePool>,
    lpdm: Option<&LicensePoolDeliveryMechanism>,
) -> bool {
    let (Some(pool), Some(lpdm)) = (pool, lpdm) else {
        return false;
    };
    if pool.open_access {
        return true;
    }
    let Some(api) = deps.adapter_for(pool) else {
        return false;
    };
    api.can_fulfill_without_loan(patron, pool, lpdm).await
}

/// 予約成立を通知するデフォルトのメールアドレス
pub fn default_notification_email_address(deps: &CirculationDeps) -> Option<String> {
    deps.library
        .settings
        .default_notification_email_address
        .clone()
}

/// 分析イベントを送出する
///
/// 帰属先図書館の優先順位：
/// 1. イベントの利用者が属する図書館
/// 2. リクエストコンテキストの図書館
/// 3. エンジン自身に束縛された図書館
///
/// 地区情報は `include_neighborhood` が指定され、かつリクエストの
/// 認証済み利用者がイベントの帰属先利用者と同一の場合にのみ付与する
/// （他人の分析イベントへ地区情報が漏れるのを防ぐ）。
///
/// 送出は fire-and-forget であり、失敗しても操作は失敗しない。
pub(crate) async fn collect_event(
    deps: &CirculationDeps,
    ctx: &RequestContext,
    patron: Option<&Patron>,
    pool: Option<&LicensePool>,
    name: CirculationEventType,
    include_neighborhood: bool,
) {
    let library_id = patron
        .map(|p| p.library_id)
        .or(ctx.library_id)
        .unwrap_or(deps.library.id);

    let neighborhood = if include_neighborhood
        && patron.is_some()
        && ctx.patron_id == patron.map(|p| p.id)
    {
        ctx.patron_neighborhood.clone()
    } else {
        None
    };

    deps.analytics
        .collect_event(CirculationEvent {
            library_id,
            license_pool_id: pool.map(|p| p.id),
            name,
            neighborhood,
            time: Utc::now(),
        })
        .await;
}

/// プールから転送レコード用の識別ブロックを作る
fn source_for(pool: &LicensePool) -> CirculationSource {
    CirculationSource::new(
        Some(pool.collection_id),
        pool.data_source.clone(),
        pool.identifier.clone(),
    )
}

/// 配信方式を人間が読める形で表す（競合エラーのメッセージ用）
fn describe_mechanism(lpdm: &LicensePoolDeliveryMechanism) -> String {
    let content_type = lpdm.mechanism.content_type.as_deref().unwrap_or("unknown");
    match lpdm.mechanism.drm_scheme.as_deref() {
        Some(drm_scheme) => format!("{content_type} ({drm_scheme})"),
        None => format!("{content_type} (DRM-free)"),
    }
}

/// オープンアクセスのプールを、アダプタを介さずフルフィルする
///
/// 要求されたLPDMのリソースが使えなければ、同じ (コンテンツ種別,
/// DRM方式) を持つ別のLPDMを探す。どれも使えなければ
/// FormatNotAvailable。
fn open_access_fulfillment(
    pool: &LicensePool,
    lpdm: &LicensePoolDeliveryMechanism,
) -> CirculationResult<Fulfillment> {
    if let Some(data) = open_access_data(lpdm) {
        return Ok(Fulfillment::eager(data));
    }
    for candidate in &pool.delivery_mechanisms {
        if candidate.id != lpdm.id
            && candidate.mechanism.content_type == lpdm.mechanism.content_type
            && candidate.mechanism.drm_scheme == lpdm.mechanism.drm_scheme
        {
            if let Some(data) = open_access_data(candidate) {
                return Ok(Fulfillment::eager(data));
            }
        }
    }
    Err(CirculationError::FormatNotAvailable)
}

/// LPDM のリソースからフルフィルメント情報を作る（使えなければ None）
fn open_access_data(lpdm: &LicensePoolDeliveryMechanism) -> Option<FulfillmentData> {
    let resource = lpdm.resource.as_ref()?;
    let representation = resource.representation.as_ref()?;
    if let Some(content) = &representation.content {
        return Some(FulfillmentData {
            content_link: None,
            content_type: representation
                .media_type
                .clone()
                .or_else(|| lpdm.mechanism.content_type.clone()),
            content: Some(content.clone()),
            content_expires: None,
            content_link_redirect: false,
            response_override: None,
        });
    }
    let link = representation.public_url.clone()?;
    Some(FulfillmentData {
        content_link: Some(link),
        content_type: representation
            .media_type
            .clone()
            .or_else(|| lpdm.mechanism.content_type.clone()),
        content: None,
        content_expires: None,
        content_link_redirect: false,
        response_override: None,
    })
}
