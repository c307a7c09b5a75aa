//! Claim coordination tests: at most one winner per job, losers told why.

mod test_harness;

use axum::http::StatusCode;
use tokio::task::JoinSet;
use uuid::Uuid;

use dispatch_lite::error::DispatchError;
use dispatch_lite::model::{JobRequest, Provider, ServiceKind};
use dispatch_lite::store::JobStore;
use test_harness::TestApp;

async fn seed_pending_job(app: &TestApp) -> Uuid {
    let job = JobRequest::new(Uuid::new_v4(), ServiceKind::Ride, None, None, 10_000);
    app.store
        .insert_job(job, Vec::new())
        .await
        .expect("seed job")
        .id
}

async fn seed_provider(app: &TestApp) -> Uuid {
    let provider = Provider::new(Uuid::new_v4(), vec![ServiceKind::Ride], 10.0);
    app.store
        .upsert_provider(provider)
        .await
        .expect("seed provider")
        .id
}

#[tokio::test]
async fn test_concurrent_claims_have_exactly_one_winner() {
    let app = TestApp::new().await;
    let job_id = seed_pending_job(&app).await;

    let mut providers = Vec::new();
    for _ in 0..50 {
        providers.push(seed_provider(&app).await);
    }

    let mut set = JoinSet::new();
    for provider_id in providers {
        let claims = app.state.claims.clone();
        set.spawn(async move { (provider_id, claims.claim(job_id, provider_id).await) });
    }

    let mut winners = Vec::new();
    let mut losses = 0;
    while let Some(joined) = set.join_next().await {
        let (provider_id, outcome) = joined.unwrap();
        match outcome {
            Ok(job) => {
                assert_eq!(job.provider_id, Some(provider_id));
                winners.push(provider_id);
            }
            Err(DispatchError::AlreadyClaimed { winner, .. }) => {
                assert!(winner.is_some(), "loser must learn who won");
                losses += 1;
            }
            Err(other) => panic!("unexpected claim outcome: {}", other),
        }
    }

    assert_eq!(winners.len(), 1, "exactly one provider may win");
    assert_eq!(losses, 49);

    let winner = winners[0];
    let job = app.store.job(job_id).await.unwrap();
    assert_eq!(job.provider_id, Some(winner));
    let provider = app.store.provider(winner).await.unwrap();
    assert_eq!(provider.current_job, Some(job_id));
}

#[tokio::test]
async fn test_simultaneous_pair_resolves_to_single_winner() {
    let app = TestApp::new().await;
    let job_id = seed_pending_job(&app).await;
    let a = seed_provider(&app).await;
    let b = seed_provider(&app).await;

    let (ra, rb) = tokio::join!(
        app.state.claims.claim(job_id, a),
        app.state.claims.claim(job_id, b)
    );

    let wins = [ra.is_ok(), rb.is_ok()].iter().filter(|w| **w).count();
    assert_eq!(wins, 1);

    let loser = if ra.is_ok() { rb } else { ra };
    assert!(matches!(
        loser,
        Err(DispatchError::AlreadyClaimed { winner: Some(_), .. })
    ));
}

#[tokio::test]
async fn test_second_claim_via_api_conflicts() {
    let app = TestApp::new().await;
    let requester = Uuid::new_v4();
    app.fund_requester(requester, 20_000).await;
    let job_id = app.create_job(requester, "ride", 10_000, None).await;
    let a = app.register_provider(None).await;
    let b = app.register_provider(None).await;

    let (status, body) = app.claim(job_id, a).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "won");
    assert_eq!(body["job"]["status"], "matched");

    let (status, body) = app.claim(job_id, b).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "already_claimed");
}

#[tokio::test]
async fn test_claim_on_cancelled_job_is_invalid_transition() {
    let app = TestApp::new().await;
    let requester = Uuid::new_v4();
    app.fund_requester(requester, 20_000).await;
    let job_id = app.create_job(requester, "ride", 10_000, None).await;
    let provider = app.register_provider(None).await;

    let (status, _) = app
        .post(
            &format!("/api/jobs/{}/cancel", job_id),
            serde_json::json!({ "party": "requester" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.claim(job_id, provider).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "invalid_transition");
}

#[tokio::test]
async fn test_busy_provider_cannot_claim_second_job() {
    let app = TestApp::new().await;
    let first = seed_pending_job(&app).await;
    let second = seed_pending_job(&app).await;
    let provider = seed_provider(&app).await;

    app.state.claims.claim(first, provider).await.unwrap();
    let err = app.state.claims.claim(second, provider).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::WorkerBusy { current_job, .. } if current_job == first
    ));
}

#[tokio::test]
async fn test_winner_retry_reports_win_not_conflict() {
    let app = TestApp::new().await;
    let job_id = seed_pending_job(&app).await;
    let provider = seed_provider(&app).await;

    let first = app.state.claims.claim(job_id, provider).await.unwrap();
    assert_eq!(first.provider_id, Some(provider));

    // A retry after an unknown outcome must find the earlier win.
    let second = app.state.claims.claim(job_id, provider).await.unwrap();
    assert_eq!(second.provider_id, Some(provider));
    assert_eq!(second.version, first.version, "retry must not rewrite the row");
}

#[tokio::test]
async fn test_claim_unknown_job_or_provider_is_not_found() {
    let app = TestApp::new().await;
    let job_id = seed_pending_job(&app).await;
    let provider = seed_provider(&app).await;

    let (status, body) = app.claim(Uuid::new_v4(), provider).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, body) = app.claim(job_id, Uuid::new_v4()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}
