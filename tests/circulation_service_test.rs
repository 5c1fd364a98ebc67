mod common;

use chrono::{Duration, Utc};

use common::{open_access_mechanism, pool_with_mechanism, streaming_mechanism,
    CirculationFixture, ADOBE_DRM, EPUB_MEDIA_TYPE, PROTOCOL};
use rusty_circulation::application::circulation::{
    borrow, can_revoke_hold, fulfill, release_hold, revoke_loan, RequestContext,
};
use rusty_circulation::domain::commands::{FulfillBook, ReleaseHold, RevokeLoan};
use rusty_circulation::domain::errors::CirculationError;
use rusty_circulation::domain::events::CirculationEventType;
use rusty_circulation::domain::fulfillment::{Fulfillment, FulfillmentData};
use rusty_circulation::domain::records::CheckoutOutcome;
use rusty_circulation::domain::value_objects::LicensePoolId;
use rusty_circulation::ports::vendor_adapter::{
    AdapterCapabilities, DeliveryMechanismStep, InternalFormatMap,
};

fn fulfill_cmd(fixture: &CirculationFixture) -> FulfillBook {
    FulfillBook {
        patron_id: fixture.patron.id,
        pin: "1234".to_string(),
        license_pool_id: fixture.pool.id,
        delivery_mechanism: fixture.lpdm.id,
        sync_on_failure: true,
    }
}

// ============================================================================
// 貸出（borrow）
// ============================================================================

// S1: 新規貸出。貸出とCheckOutイベントが1件ずつできる
#[tokio::test]
async fn test_fresh_borrow_creates_loan_and_sends_analytics_event() {
    let fixture = CirculationFixture::new().await;
    let start = Utc::now();
    let end = start + Duration::hours(1);
    fixture.adapter.queue_checkout(Ok(CheckoutOutcome::Loan(
        fixture.loan_info(Some(start), Some(end)),
    )));

    let (loan, hold, is_new) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    // 排他性：貸出と予約のちょうど一方
    let loan = loan.expect("expected a loan");
    assert!(hold.is_none());
    assert!(is_new);
    assert_eq!(loan.start, Some(start));
    assert_eq!(loan.end, Some(end));

    assert_eq!(fixture.analytics.count(), 1);
    let event = fixture.analytics.last_event().unwrap();
    assert_eq!(event.name, CirculationEventType::CheckOut);
    assert_eq!(event.library_id, fixture.library.id);
    assert_eq!(event.license_pool_id, Some(fixture.pool.id));
}

// S3: AlreadyCheckedOut はプレースホルダ貸出（期限 now+1h）になる
#[tokio::test]
async fn test_already_checked_out_synthesizes_placeholder_loan() {
    let fixture = CirculationFixture::new().await;
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::AlreadyCheckedOut));

    let before = Utc::now();
    let (loan, hold, is_new) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    let loan = loan.expect("expected a placeholder loan");
    assert!(hold.is_none());
    assert!(is_new);
    // 期限はおよそ1時間後。実際の値は次回同期で判明する
    let end = loan.end.expect("placeholder loan should carry an end date");
    assert!(end >= before + Duration::minutes(59));
    assert!(end <= Utc::now() + Duration::minutes(61));
    assert_eq!(fixture.analytics.count(), 1);
    assert_eq!(
        fixture.analytics.last_event().unwrap().name,
        CirculationEventType::CheckOut
    );
}

// 既存貸出がある場合は同期してから checkout する。プレースホルダは
// 既存貸出の external_identifier を引き継ぐ
#[tokio::test]
async fn test_renewal_placeholder_carries_external_identifier() {
    let fixture = CirculationFixture::new().await;
    fixture.add_local_loan(Some(Utc::now() - Duration::hours(2)));
    // 強制同期がこの貸出をリモート側でも確認できるようにしておく
    let mut remote = fixture.loan_info(
        Some(Utc::now() - Duration::hours(2)),
        Some(Utc::now() + Duration::days(7)),
    );
    remote.external_identifier = Some("vendor-loan-1".to_string());
    fixture
        .adapter
        .add_remote_activity(rusty_circulation::domain::records::ActivityItem::Loan(remote));
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::AlreadyCheckedOut));

    let (loan, _, is_new) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    let loan = loan.expect("expected the existing loan back");
    // 既存行の更新なので新規ではなく、イベントも出さない
    assert!(!is_new);
    assert_eq!(loan.external_identifier.as_deref(), Some("vendor-loan-1"));
    assert_eq!(fixture.analytics.count(), 0);
}

// S2: 更新（renewal）は予約待ちがいると拒否される
#[tokio::test]
async fn test_renewal_suppressed_when_other_patrons_hold_the_work() {
    let fixture = CirculationFixture::new().await;
    // 直近に始まった貸出は強制同期でも刈り取られない
    fixture.add_local_loan(Some(Utc::now()));
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::NoAvailableCopies));

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(result, Err(CirculationError::CannotRenew { .. })));
    // 貸出は残り、予約はできず、イベントも出ない
    assert!(fixture.local_loan().await.is_some());
    assert!(fixture.local_hold().await.is_none());
    assert_eq!(fixture.analytics.count(), 0);
}

// 在庫なし（既存貸出なし）は在庫を更新してから予約へ進む
#[tokio::test]
async fn test_loan_becomes_hold_if_no_available_copies() {
    let fixture = CirculationFixture::new().await;
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::NoAvailableCopies));
    fixture.adapter.queue_hold(Ok(fixture.hold_info(Some(10))));

    let (loan, hold, is_new) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert!(loan.is_none());
    let hold = hold.expect("expected a hold");
    assert!(is_new);
    assert_eq!(hold.position, Some(10));
    // 誤った在庫観は即座に修正される
    assert_eq!(fixture.adapter.availability_updated_for(), vec![fixture.pool.id]);
    assert_eq!(
        fixture.analytics.last_event().unwrap().name,
        CirculationEventType::HoldPlace
    );
}

// ベンダーが例外ではなく HoldActivity を返して格下げするパターン
#[tokio::test]
async fn test_borrow_creates_hold_if_vendor_returns_hold() {
    let fixture = CirculationFixture::new().await;
    fixture
        .adapter
        .queue_checkout(Ok(CheckoutOutcome::Hold(fixture.hold_info(Some(1)))));

    let (loan, hold, is_new) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert!(loan.is_none());
    assert_eq!(hold.unwrap().position, Some(1));
    assert!(is_new);
}

// AlreadyOnHold は位置不明の予約を合成する（先頭扱いにしない）
#[tokio::test]
async fn test_already_on_hold_synthesizes_hold_with_unknown_position() {
    let fixture = CirculationFixture::new().await;
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::AlreadyOnHold));

    let (loan, hold, _) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert!(loan.is_none());
    assert_eq!(hold.unwrap().position, None);
}

// ベンダー側の貸出上限：予約で満たせるならそれでよい
#[tokio::test]
async fn test_vendor_side_loan_limit_allows_for_hold_placement() {
    let fixture = CirculationFixture::new().await;
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::PatronLoanLimitReached { limit: 10 }));
    fixture.adapter.queue_hold(Ok(fixture.hold_info(Some(10))));

    let (loan, hold, is_new) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert!(loan.is_none());
    assert!(hold.is_some());
    assert!(is_new);
}

// 貸出例外の再送出：予約が CurrentlyAvailable で失敗したら、
// 本当の問題は最初の貸出例外のほう
#[tokio::test]
async fn test_loan_exception_reraised_if_hold_placement_fails() {
    let fixture = CirculationFixture::new().await;
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::PatronLoanLimitReached { limit: 10 }));
    fixture
        .adapter
        .queue_hold(Err(CirculationError::CurrentlyAvailable));

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(
        result,
        Err(CirculationError::PatronLoanLimitReached { limit: 10 })
    ));
    // checkout と place_hold の両方を実際に呼び切っている
    assert_eq!(fixture.adapter.remaining_checkout_responses(), 0);
    assert_eq!(fixture.adapter.remaining_hold_responses(), 0);
}

// ============================================================================
// 貸出資格（ベンダー呼び出し前のゲート）
// ============================================================================

// 期限切れカードでは何も起きない。ベンダーは呼ばれない
// （呼ばれていればモックが RemoteInitiatedServerError を返すはず）
#[tokio::test]
async fn test_borrow_with_expired_card_fails_before_any_vendor_call() {
    let fixture = CirculationFixture::new().await;
    let mut patron = fixture.patron.clone();
    patron.authorization_expires = Some(Utc::now() - Duration::days(1));
    fixture.update_patron(patron);

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(result, Err(CirculationError::AuthorizationExpired)));
    assert!(fixture.adapter.availability_updated_for().is_empty());
}

#[tokio::test]
async fn test_borrow_with_outstanding_fines_fails() {
    let fixture = CirculationFixture::with_settings(
        rusty_circulation::domain::entities::LibrarySettings {
            max_outstanding_fines: Some(5.0),
            ..Default::default()
        },
    )
    .await;
    let mut patron = fixture.patron.clone();
    patron.fines = 10.0;
    fixture.update_patron(patron);

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(
        result,
        Err(CirculationError::OutstandingFines { .. })
    ));
}

#[tokio::test]
async fn test_borrow_with_block_fails() {
    let fixture = CirculationFixture::new().await;
    let mut patron = fixture.patron.clone();
    patron.block_reason = Some("card reported lost".to_string());
    fixture.update_patron(patron);

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(
        result,
        Err(CirculationError::AuthorizationBlocked { .. })
    ));
}

// ============================================================================
// 図書館ポリシーの上限（enforce_limits）
// ============================================================================

// S4: 両方の上限に達している場合は PatronLoanLimitReached。
// ベンダー呼び出しもDB変更も起きない
#[tokio::test]
async fn test_both_limits_reached_raises_loan_limit_without_vendor_call() {
    let fixture = CirculationFixture::with_settings(
        rusty_circulation::domain::entities::LibrarySettings {
            loan_limit: Some(2),
            hold_limit: Some(1),
            ..Default::default()
        },
    )
    .await;
    fixture.add_countable_loans(2);
    fixture.add_extra_holds(1);

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(
        result,
        Err(CirculationError::PatronLoanLimitReached { limit: 2 })
    ));
    // 両上限のときは在庫更新すら行わない
    assert!(fixture.adapter.availability_updated_for().is_empty());
    assert!(fixture.local_loan().await.is_none());
    assert!(fixture.local_hold().await.is_none());
    assert_eq!(fixture.analytics.count(), 0);
}

// 貸出上限のみ・在庫あり：在庫を最新化した上で貸出上限を返す
#[tokio::test]
async fn test_loan_limit_with_available_copy_refreshes_availability() {
    let fixture = CirculationFixture::with_settings(
        rusty_circulation::domain::entities::LibrarySettings {
            loan_limit: Some(1),
            ..Default::default()
        },
    )
    .await;
    fixture.add_countable_loans(1);

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(
        result,
        Err(CirculationError::PatronLoanLimitReached { limit: 1 })
    ));
    assert_eq!(fixture.adapter.availability_updated_for(), vec![fixture.pool.id]);
}

// 貸出上限に達していても在庫がなければ予約はできる
#[tokio::test]
async fn test_loan_limit_does_not_block_hold_on_unavailable_book() {
    let fixture = CirculationFixture::with_settings(
        rusty_circulation::domain::entities::LibrarySettings {
            loan_limit: Some(1),
            ..Default::default()
        },
    )
    .await;
    fixture.add_countable_loans(1);
    let mut pool = fixture.pool.clone();
    pool.licenses_available = 0;
    pool.patrons_in_hold_queue = 2;
    fixture.store.insert_pool(pool);
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::NoAvailableCopies));
    fixture.adapter.queue_hold(Ok(fixture.hold_info(Some(3))));

    let (loan, hold, _) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert!(loan.is_none());
    assert!(hold.is_some());
}

// 予約上限・在庫なし：PatronHoldLimitReached
#[tokio::test]
async fn test_hold_limit_with_unavailable_book() {
    let fixture = CirculationFixture::with_settings(
        rusty_circulation::domain::entities::LibrarySettings {
            hold_limit: Some(1),
            ..Default::default()
        },
    )
    .await;
    fixture.add_extra_holds(1);
    let mut pool = fixture.pool.clone();
    pool.licenses_available = 0;
    pool.patrons_in_hold_queue = 2;
    fixture.store.insert_pool(pool);

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(
        result,
        Err(CirculationError::PatronHoldLimitReached { limit: 1 })
    ));
}

// オープンアクセスのプールは上限の対象外
#[tokio::test]
async fn test_open_access_pool_bypasses_limits() {
    let fixture = CirculationFixture::with_settings(
        rusty_circulation::domain::entities::LibrarySettings {
            loan_limit: Some(1),
            hold_limit: Some(1),
            ..Default::default()
        },
    )
    .await;
    fixture.add_countable_loans(1);
    fixture.add_extra_holds(1);
    let mut pool = fixture.pool.clone();
    pool.open_access = true;
    fixture.store.insert_pool(pool);
    fixture.adapter.queue_checkout(Ok(CheckoutOutcome::Loan(
        fixture.loan_info(Some(Utc::now()), None),
    )));

    let (loan, _, is_new) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert!(loan.is_some());
    assert!(is_new);
}

// ============================================================================
// 予約の昇格・降格と allow_holds
// ============================================================================

// 単一性：貸出が成立したら既存予約は消える
#[tokio::test]
async fn test_successful_borrow_deletes_preexisting_hold() {
    let fixture = CirculationFixture::new().await;
    fixture.add_local_hold(Some(0));
    fixture.adapter.queue_checkout(Ok(CheckoutOutcome::Loan(
        fixture.loan_info(Some(Utc::now()), Some(Utc::now() + Duration::days(14))),
    )));

    let (loan, hold, _) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert!(loan.is_some());
    assert!(hold.is_none());
    assert!(fixture.local_hold().await.is_none());
}

// 単一性：ベンダーが予約へ格下げしたら既存貸出は消える（稀な降格）
#[tokio::test]
async fn test_vendor_downgrade_to_hold_deletes_preexisting_loan() {
    let fixture = CirculationFixture::new().await;
    // 直近に始まった貸出なので強制同期でも残る
    fixture.add_local_loan(Some(Utc::now()));
    fixture
        .adapter
        .queue_checkout(Ok(CheckoutOutcome::Hold(fixture.hold_info(Some(7)))));

    let (loan, hold, _) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert!(loan.is_none());
    assert!(hold.is_some());
    assert!(fixture.local_loan().await.is_none());
    assert!(fixture.local_hold().await.is_some());
}

// allow_holds=false の図書館では予約へ落ちる借用はエラーになる
#[tokio::test]
async fn test_holds_not_permitted_library_raises_instead_of_holding() {
    let fixture = CirculationFixture::with_settings(
        rusty_circulation::domain::entities::LibrarySettings {
            allow_holds: false,
            ..Default::default()
        },
    )
    .await;
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::NoAvailableCopies));

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    // place_hold は呼ばれず（キューも積んでいない）、専用のエラーになる
    assert!(matches!(result, Err(CirculationError::HoldsNotPermitted)));
    assert!(fixture.local_hold().await.is_none());
}

// allow_holds=false でも貸出が成立する借用には影響しない
#[tokio::test]
async fn test_holds_not_permitted_library_still_loans() {
    let fixture = CirculationFixture::with_settings(
        rusty_circulation::domain::entities::LibrarySettings {
            allow_holds: false,
            ..Default::default()
        },
    )
    .await;
    fixture.adapter.queue_checkout(Ok(CheckoutOutcome::Loan(
        fixture.loan_info(Some(Utc::now()), Some(Utc::now() + Duration::days(14))),
    )));

    let (loan, _, _) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();
    assert!(loan.is_some());
}

// ============================================================================
// 配信方式の確定タイミング（BORROW_STEP）
// ============================================================================

#[tokio::test]
async fn test_borrow_step_requires_delivery_mechanism() {
    let fixture = CirculationFixture::with_capabilities(AdapterCapabilities {
        set_delivery_mechanism_at: DeliveryMechanismStep::Borrow,
        ..AdapterCapabilities::default()
    })
    .await;
    let mut cmd = fixture.borrow_cmd();
    cmd.delivery_mechanism = None;

    let result = borrow(&fixture.deps, &RequestContext::anonymous(), cmd).await;
    assert!(matches!(
        result,
        Err(CirculationError::DeliveryMechanismMissing)
    ));
}

#[tokio::test]
async fn test_borrow_step_binds_mechanism_to_loan() {
    let fixture = CirculationFixture::with_capabilities(AdapterCapabilities {
        set_delivery_mechanism_at: DeliveryMechanismStep::Borrow,
        ..AdapterCapabilities::default()
    })
    .await;
    fixture.adapter.queue_checkout(Ok(CheckoutOutcome::Loan(
        fixture.loan_info(Some(Utc::now()), Some(Utc::now() + Duration::days(14))),
    )));

    let (loan, _, _) = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();

    assert_eq!(loan.unwrap().fulfillment_id, Some(fixture.lpdm.id));
}

// 対応表にない配信方式はベンダー内部フォーマットへ解決できない
#[tokio::test]
async fn test_unmapped_delivery_mechanism_fails_checkout() {
    let fixture = CirculationFixture::with_capabilities(AdapterCapabilities {
        set_delivery_mechanism_at: DeliveryMechanismStep::Borrow,
        ..AdapterCapabilities::default()
    })
    .await;
    let mut map = InternalFormatMap::new();
    map.insert(
        (Some("application/pdf".to_string()), Some(ADOBE_DRM.to_string())),
        "PDF".to_string(),
    );
    fixture.adapter.set_format_map(map);

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(
        result,
        Err(CirculationError::DeliveryMechanismError { .. })
    ));
}

// 担当アダプタのないプールは NoLicenses
#[tokio::test]
async fn test_pool_without_adapter_raises_no_licenses() {
    let fixture = CirculationFixture::new().await;
    let (orphan_pool, orphan_lpdm) = pool_with_mechanism(
        rusty_circulation::domain::value_objects::CollectionId::new(99),
        "9780000009999",
        Some(EPUB_MEDIA_TYPE),
        Some(ADOBE_DRM),
    );
    fixture.store.insert_pool(orphan_pool.clone());
    let mut cmd = fixture.borrow_cmd();
    cmd.license_pool_id = orphan_pool.id;
    cmd.delivery_mechanism = Some(orphan_lpdm.id);

    let result = borrow(&fixture.deps, &RequestContext::anonymous(), cmd).await;
    assert!(matches!(result, Err(CirculationError::NoLicenses)));
}

// NoLicenses は在庫を更新した上で再送出される
#[tokio::test]
async fn test_no_licenses_prompts_availability_update() {
    let fixture = CirculationFixture::new().await;
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::NoLicenses));

    let result = borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await;

    assert!(matches!(result, Err(CirculationError::NoLicenses)));
    assert_eq!(fixture.adapter.availability_updated_for(), vec![fixture.pool.id]);
}

// ============================================================================
// フルフィルメント
// ============================================================================

#[tokio::test]
async fn test_fulfill_returns_content_and_binds_mechanism() {
    let fixture = CirculationFixture::new().await;
    let loan = fixture.add_local_loan(Some(Utc::now()));
    fixture.adapter.queue_fulfill(Ok(fixture.link_fulfillment()));

    let fulfillment = fulfill(
        &fixture.deps,
        &RequestContext::anonymous(),
        fulfill_cmd(&fixture),
    )
    .await
    .unwrap();

    assert!(fulfillment.content_link().await.unwrap().is_some());
    // 非ストリーミングの方式は貸出に記録される
    let bound = fixture.local_loan().await.unwrap();
    assert_eq!(bound.id, loan.id);
    assert_eq!(bound.fulfillment_id, Some(fixture.lpdm.id));
    assert_eq!(
        fixture.analytics.last_event().unwrap().name,
        CirculationEventType::Fulfill
    );
}

// S6: 既に確定済みの方式と非互換ならベンダーを呼ばずに競合エラー
#[tokio::test]
async fn test_fulfill_with_conflicting_drm_scheme() {
    let fixture = CirculationFixture::new().await;
    // DRMフリーのEPUBという別方式をプールへ追加する
    let mut no_drm_lpdm = fixture.lpdm.clone();
    no_drm_lpdm.id = rusty_circulation::domain::value_objects::LpdmId::new();
    no_drm_lpdm.mechanism.id = rusty_circulation::domain::value_objects::DeliveryMechanismId::new();
    no_drm_lpdm.mechanism.drm_scheme = None;
    let mut pool = fixture.pool.clone();
    pool.delivery_mechanisms.push(no_drm_lpdm.clone());
    fixture.store.insert_pool(pool);

    let mut loan = fixture.add_local_loan(Some(Utc::now()));
    loan.fulfillment_id = Some(fixture.lpdm.id);
    fixture.store.insert_loan(loan);

    let mut cmd = fulfill_cmd(&fixture);
    cmd.delivery_mechanism = no_drm_lpdm.id;

    let result = fulfill(&fixture.deps, &RequestContext::anonymous(), cmd).await;

    assert!(matches!(
        result,
        Err(CirculationError::DeliveryMechanismConflict { .. })
    ));
    assert_eq!(fixture.analytics.count(), 0);
}

// 貸出がなく、同期しても見つからなければ NoActiveLoan
#[tokio::test]
async fn test_fulfill_without_loan_syncs_once_then_fails() {
    let fixture = CirculationFixture::new().await;

    let result = fulfill(
        &fixture.deps,
        &RequestContext::anonymous(),
        fulfill_cmd(&fixture),
    )
    .await;

    assert!(matches!(result, Err(CirculationError::NoActiveLoan)));
}

// 同期によってリモートの貸出が見つかればフルフィルは成立する
#[tokio::test]
async fn test_fulfill_finds_loan_after_sync() {
    let fixture = CirculationFixture::new().await;
    fixture.adapter.add_remote_activity(
        rusty_circulation::domain::records::ActivityItem::Loan(fixture.loan_info(
            Some(Utc::now() - Duration::hours(1)),
            Some(Utc::now() + Duration::days(13)),
        )),
    );
    fixture.adapter.queue_fulfill(Ok(fixture.link_fulfillment()));

    let fulfillment = fulfill(
        &fixture.deps,
        &RequestContext::anonymous(),
        fulfill_cmd(&fixture),
    )
    .await
    .unwrap();

    assert!(fulfillment.content_link().await.unwrap().is_some());
    assert!(fixture.local_loan().await.is_some());
}

// ストリーミング方式は貸出を束縛しない
#[tokio::test]
async fn test_streaming_fulfillment_does_not_bind_loan() {
    let fixture = CirculationFixture::new().await;
    let streaming = streaming_mechanism(&fixture.pool);
    let mut pool = fixture.pool.clone();
    pool.delivery_mechanisms.push(streaming.clone());
    fixture.store.insert_pool(pool);
    fixture.add_local_loan(Some(Utc::now()));
    fixture.adapter.queue_fulfill(Ok(fixture.link_fulfillment()));

    let mut cmd = fulfill_cmd(&fixture);
    cmd.delivery_mechanism = streaming.id;
    fulfill(&fixture.deps, &RequestContext::anonymous(), cmd)
        .await
        .unwrap();

    assert_eq!(fixture.local_loan().await.unwrap().fulfillment_id, None);
}

// リンクも本文もない結果は NoAcceptableFormat。イベントも出ない
#[tokio::test]
async fn test_empty_fulfillment_raises_no_acceptable_format() {
    let fixture = CirculationFixture::new().await;
    fixture.add_local_loan(Some(Utc::now()));
    fixture
        .adapter
        .queue_fulfill(Ok(Fulfillment::eager(FulfillmentData::default())));

    let result = fulfill(
        &fixture.deps,
        &RequestContext::anonymous(),
        fulfill_cmd(&fixture),
    )
    .await;

    assert!(matches!(result, Err(CirculationError::NoAcceptableFormat)));
    assert_eq!(fixture.analytics.count(), 0);
}

// 貸出なしフルフィルをアダプタが許すモデル（配信事業者型）
#[tokio::test]
async fn test_adapter_may_allow_fulfill_without_loan() {
    let fixture = CirculationFixture::new().await;
    fixture.adapter.set_fulfill_without_loan(true);
    fixture.adapter.queue_fulfill(Ok(fixture.link_fulfillment()));

    let fulfillment = fulfill(
        &fixture.deps,
        &RequestContext::anonymous(),
        fulfill_cmd(&fixture),
    )
    .await
    .unwrap();

    assert!(fulfillment.content_link().await.unwrap().is_some());
}

// オープンアクセスのプールはアダプタを介さず、貸出もなしでフルフィルできる
#[tokio::test]
async fn test_open_access_fulfillment_skips_the_adapter() {
    let fixture = CirculationFixture::new().await;
    let oa_lpdm = open_access_mechanism(&fixture.pool);
    let mut pool = fixture.pool.clone();
    pool.open_access = true;
    pool.delivery_mechanisms.push(oa_lpdm.clone());
    fixture.store.insert_pool(pool);

    // アダプタには何もキューイングしない。呼ばれたら失敗するはず
    let mut cmd = fulfill_cmd(&fixture);
    cmd.delivery_mechanism = oa_lpdm.id;
    let fulfillment = fulfill(&fixture.deps, &RequestContext::anonymous(), cmd)
        .await
        .unwrap();

    assert_eq!(
        fulfillment.content_link().await.unwrap().as_deref(),
        Some("https://archive.example.org/book.epub")
    );
    assert_eq!(
        fixture.analytics.last_event().unwrap().name,
        CirculationEventType::Fulfill
    );
}

// オープンアクセスなのに使えるリソースが1つもなければ FormatNotAvailable
#[tokio::test]
async fn test_open_access_without_usable_resource() {
    let fixture = CirculationFixture::new().await;
    let mut pool = fixture.pool.clone();
    pool.open_access = true;
    fixture.store.insert_pool(pool);

    // 要求するのはリソースを持たない既存のLPDM
    let result = fulfill(
        &fixture.deps,
        &RequestContext::anonymous(),
        fulfill_cmd(&fixture),
    )
    .await;

    assert!(matches!(result, Err(CirculationError::FormatNotAvailable)));
}

// 遅延フルフィルメントはそのままエンジンを通過し、
// ペイロード確認の時点で1回だけ取得される
#[tokio::test]
async fn test_deferred_fulfillment_flows_through_the_engine() {
    use rusty_circulation::domain::fulfillment::{DeferredFulfillment, FulfillmentFetch};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingFetch(AtomicUsize);

    #[async_trait::async_trait]
    impl FulfillmentFetch for CountingFetch {
        async fn do_fetch(
            &self,
            _key: &serde_json::Value,
        ) -> Result<FulfillmentData, CirculationError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(FulfillmentData {
                content_link: Some("https://cdn.example.com/deferred.acsm".to_string()),
                content_type: Some(EPUB_MEDIA_TYPE.to_string()),
                content: None,
                content_expires: Some(Utc::now() + Duration::hours(1)),
                content_link_redirect: false,
                response_override: None,
            })
        }
    }

    let fixture = CirculationFixture::new().await;
    fixture.add_local_loan(Some(Utc::now()));
    let fetch = Arc::new(CountingFetch(AtomicUsize::new(0)));
    let deferred = DeferredFulfillment::new(
        fixture.source(),
        serde_json::json!({"license": "L-1"}),
        fetch.clone(),
    );
    fixture
        .adapter
        .queue_fulfill(Ok(Fulfillment::Deferred(deferred)));

    let fulfillment = fulfill(
        &fixture.deps,
        &RequestContext::anonymous(),
        fulfill_cmd(&fixture),
    )
    .await
    .unwrap();

    // エンジンのペイロード確認で1回取得済み。以後の参照はキャッシュ
    assert_eq!(fetch.0.load(Ordering::SeqCst), 1);
    assert_eq!(
        fulfillment.content_link().await.unwrap().as_deref(),
        Some("https://cdn.example.com/deferred.acsm")
    );
    assert_eq!(fetch.0.load(Ordering::SeqCst), 1);
}

// ============================================================================
// 返却と予約解除
// ============================================================================

// 往復則：borrow → revoke_loan で貸出は消える
#[tokio::test]
async fn test_borrow_then_revoke_round_trip() {
    let fixture = CirculationFixture::new().await;
    fixture.adapter.queue_checkout(Ok(CheckoutOutcome::Loan(
        fixture.loan_info(Some(Utc::now()), Some(Utc::now() + Duration::days(14))),
    )));
    borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();
    fixture.adapter.queue_checkin(Ok(()));

    let result = revoke_loan(
        &fixture.deps,
        &RequestContext::anonymous(),
        RevokeLoan {
            patron_id: fixture.patron.id,
            pin: "1234".to_string(),
            license_pool_id: fixture.pool.id,
        },
    )
    .await
    .unwrap();

    assert!(result);
    assert!(fixture.local_loan().await.is_none());
    // 鮮度スタンプはクリアされ、次回同期が強制される
    assert!(fixture.reload_patron().await.last_loan_activity_sync.is_none());
    let names: Vec<_> = fixture
        .analytics
        .events()
        .into_iter()
        .map(|event| event.name)
        .collect();
    assert_eq!(
        names,
        vec![CirculationEventType::CheckOut, CirculationEventType::CheckIn]
    );
}

// NotCheckedOut は黙って回復される（ローカルとリモートの食い違いは
// 利用者に有利な側へ倒す）
#[tokio::test]
async fn test_revoke_loan_swallows_not_checked_out() {
    let fixture = CirculationFixture::new().await;
    fixture.add_local_loan(Some(Utc::now()));
    fixture
        .adapter
        .queue_checkin(Err(CirculationError::NotCheckedOut));

    let result = revoke_loan(
        &fixture.deps,
        &RequestContext::anonymous(),
        RevokeLoan {
            patron_id: fixture.patron.id,
            pin: "1234".to_string(),
            license_pool_id: fixture.pool.id,
        },
    )
    .await
    .unwrap();

    assert!(result);
    assert!(fixture.local_loan().await.is_none());
}

// CannotReturn は伝播し、ローカルの貸出行は残る
#[tokio::test]
async fn test_revoke_loan_propagates_cannot_return() {
    let fixture = CirculationFixture::new().await;
    fixture.add_local_loan(Some(Utc::now()));
    fixture.adapter.queue_checkin(Err(CirculationError::CannotReturn {
        reason: "vendor refused".to_string(),
    }));

    let result = revoke_loan(
        &fixture.deps,
        &RequestContext::anonymous(),
        RevokeLoan {
            patron_id: fixture.patron.id,
            pin: "1234".to_string(),
            license_pool_id: fixture.pool.id,
        },
    )
    .await;

    assert!(matches!(result, Err(CirculationError::CannotReturn { .. })));
    assert!(fixture.local_loan().await.is_some());
    assert_eq!(fixture.analytics.count(), 0);
}

// 往復則：place-hold → release_hold で予約は消える
#[tokio::test]
async fn test_hold_then_release_round_trip() {
    let fixture = CirculationFixture::new().await;
    fixture
        .adapter
        .queue_checkout(Err(CirculationError::NoAvailableCopies));
    fixture.adapter.queue_hold(Ok(fixture.hold_info(Some(2))));
    borrow(
        &fixture.deps,
        &RequestContext::anonymous(),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();
    fixture.adapter.queue_release_hold(Ok(()));

    let result = release_hold(
        &fixture.deps,
        &RequestContext::anonymous(),
        ReleaseHold {
            patron_id: fixture.patron.id,
            pin: "1234".to_string(),
            license_pool_id: fixture.pool.id,
        },
    )
    .await
    .unwrap();

    assert!(result);
    assert!(fixture.local_hold().await.is_none());
    assert_eq!(
        fixture.analytics.last_event().unwrap().name,
        CirculationEventType::HoldRelease
    );
}

#[tokio::test]
async fn test_release_hold_swallows_not_on_hold() {
    let fixture = CirculationFixture::new().await;
    fixture.add_local_hold(Some(4));
    fixture
        .adapter
        .queue_release_hold(Err(CirculationError::NotOnHold));

    let result = release_hold(
        &fixture.deps,
        &RequestContext::anonymous(),
        ReleaseHold {
            patron_id: fixture.patron.id,
            pin: "1234".to_string(),
            license_pool_id: fixture.pool.id,
        },
    )
    .await
    .unwrap();

    assert!(result);
    assert!(fixture.local_hold().await.is_none());
}

// ============================================================================
// can_revoke_hold とレジストリ
// ============================================================================

#[tokio::test]
async fn test_can_revoke_hold_depends_on_position_and_capability() {
    let fixture = CirculationFixture::new().await;
    let queued = fixture.add_local_hold(Some(5));
    assert!(can_revoke_hold(&fixture.deps, &fixture.pool, &queued));

    // 取り置き済みの予約はアダプタの capability 次第
    let mut reserved = queued.clone();
    reserved.position = Some(0);
    assert!(can_revoke_hold(&fixture.deps, &fixture.pool, &reserved));

    fixture.adapter.set_capabilities(AdapterCapabilities {
        can_revoke_hold_when_reserved: false,
        supports_patron_activity: true,
        ..AdapterCapabilities::default()
    });
    assert!(!can_revoke_hold(&fixture.deps, &fixture.pool, &reserved));
}

// アダプタ構築の失敗は保存され、構築時には送出されない
#[tokio::test]
async fn test_configuration_error_is_stored_not_raised() {
    use rusty_circulation::adapters::mock::MockVendorAdapter;
    use rusty_circulation::adapters::mock::{InMemoryCirculationStore, MockAnalyticsSink};
    use rusty_circulation::application::circulation::AdapterRegistry;
    use rusty_circulation::domain::entities::{Collection, Library, LibrarySettings};
    use rusty_circulation::domain::value_objects::{CollectionId, LibraryId};
    use rusty_circulation::ports::vendor_adapter::VendorAdapter;
    use std::sync::Arc;

    let store = Arc::new(InMemoryCirculationStore::new());
    let analytics = Arc::new(MockAnalyticsSink::new());
    let library = Library {
        id: LibraryId::new(),
        name: "Main Street Library".to_string(),
        settings: LibrarySettings::default(),
    };
    store.insert_library(library.clone());
    // set_delivery_mechanism_at の値が不正な設定
    store.insert_collection(Collection {
        id: CollectionId::new(7),
        library_id: library.id,
        name: "Broken Collection".to_string(),
        protocol: PROTOCOL.to_string(),
        integration_configuration: serde_json::json!({
            "set_delivery_mechanism_at": "sometime"
        }),
    });

    let mut registry = AdapterRegistry::new();
    registry.register(
        PROTOCOL,
        Arc::new(|store, collection| {
            Ok(Arc::new(MockVendorAdapter::from_collection(store, collection)?)
                as Arc<dyn VendorAdapter>)
        }),
    );

    let deps = rusty_circulation::application::circulation::CirculationDeps::build(
        store.clone(),
        analytics,
        library.id,
        &registry,
    )
    .await
    .unwrap();

    assert!(matches!(
        deps.initialization_exception(CollectionId::new(7)),
        Some(CirculationError::ConfigurationError { .. })
    ));
    assert!(deps.adapter_for_collection(CollectionId::new(7)).is_none());
}

// ============================================================================
// 分析イベントの帰属
// ============================================================================

// 地区情報はリクエストの認証済み利用者が同一人物の場合のみ付く
#[tokio::test]
async fn test_neighborhood_is_attached_only_for_the_requesting_patron() {
    let fixture = CirculationFixture::new().await;
    let mut patron = fixture.patron.clone();
    patron.neighborhood = Some("Shimokitazawa".to_string());
    fixture.update_patron(patron.clone());

    fixture.adapter.queue_checkout(Ok(CheckoutOutcome::Loan(
        fixture.loan_info(Some(Utc::now()), Some(Utc::now() + Duration::days(14))),
    )));
    borrow(
        &fixture.deps,
        &RequestContext::for_patron(&patron),
        fixture.borrow_cmd(),
    )
    .await
    .unwrap();
    assert_eq!(
        fixture.analytics.last_event().unwrap().neighborhood.as_deref(),
        Some("Shimokitazawa")
    );

    // 匿名リクエストでは付かない
    fixture.adapter.queue_checkin(Ok(()));
    revoke_loan(
        &fixture.deps,
        &RequestContext::anonymous(),
        RevokeLoan {
            patron_id: fixture.patron.id,
            pin: "1234".to_string(),
            license_pool_id: fixture.pool.id,
        },
    )
    .await
    .unwrap();
    assert_eq!(fixture.analytics.last_event().unwrap().neighborhood, None);
}

// 資格情報の保存・取得（アダプタのベアラートークンキャッシュ用）
#[tokio::test]
async fn test_credential_round_trip() {
    use rusty_circulation::domain::entities::Credential;
    use rusty_circulation::ports::circulation_store::CirculationStore;

    let fixture = CirculationFixture::new().await;
    let credential = Credential {
        data_source: common::DATA_SOURCE.to_string(),
        credential_type: "OAuth Token".to_string(),
        collection_id: Some(fixture.pool.collection_id),
        patron_id: None,
        credential: "token-1".to_string(),
        expires: Some(Utc::now() + Duration::minutes(30)),
    };
    fixture.store.store_credential(credential.clone()).await.unwrap();

    let fetched = fixture
        .store
        .credential(
            common::DATA_SOURCE,
            "OAuth Token",
            Some(fixture.pool.collection_id),
            None,
        )
        .await
        .unwrap()
        .expect("credential should be stored");
    assert_eq!(fetched.credential, "token-1");

    // 同一キーへの保存は上書きになる
    fixture
        .store
        .store_credential(Credential {
            credential: "token-2".to_string(),
            ..credential
        })
        .await
        .unwrap();
    let replaced = fixture
        .store
        .credential(
            common::DATA_SOURCE,
            "OAuth Token",
            Some(fixture.pool.collection_id),
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replaced.credential, "token-2");
}

// 存在しないプールの借用は PoolNotFound
#[tokio::test]
async fn test_borrow_unknown_pool() {
    let fixture = CirculationFixture::new().await;
    let mut cmd = fixture.borrow_cmd();
    cmd.license_pool_id = LicensePoolId::new();

    let result = borrow(&fixture.deps, &RequestContext::anonymous(), cmd).await;
    assert!(matches!(result, Err(CirculationError::PoolNotFound)));
}
