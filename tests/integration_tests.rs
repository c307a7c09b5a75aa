//! End-to-end stories through the HTTP surface: create, rank, claim,
//! advance, settle, tip, cancel, with the ledger checked at every turn.

mod test_harness;

use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use test_harness::TestApp;

#[tokio::test]
async fn test_full_dispatch_story() {
    let app = TestApp::new().await;

    // A requester funds their wallet and posts a ride.
    let requester = Uuid::new_v4();
    app.fund_requester(requester, 30_000).await;
    let (status, job) = app
        .post(
            "/api/jobs",
            json!({
                "requester_id": requester,
                "service": "ride",
                "price_cents": 10_000,
                "pickup": { "lat": 40.01, "lng": -74.0 },
                "dropoff": { "lat": 40.10, "lng": -74.0 },
                "requester_rating": 4.5,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let job_id: Uuid = job["id"].as_str().unwrap().parse().unwrap();

    // The hold is already in escrow.
    assert_eq!(app.balance("requester", requester).await, 20_000);
    assert_eq!(app.balance("escrow", Uuid::nil()).await, 10_000);

    // A nearby provider comes online and sees the job ranked first.
    let provider = app.register_provider(Some((40.0, -74.0))).await;
    let (status, ranked) = app
        .get(&format!("/api/providers/{}/jobs", provider))
        .await;
    assert_eq!(status, StatusCode::OK);
    let ranked = ranked.as_array().unwrap();
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0]["id"], job_id.to_string());
    assert!(ranked[0]["score"].as_f64().unwrap() > 0.0);
    assert!(ranked[0]["breakdown"]["rating"].as_f64().unwrap() > 0.8);

    // They claim it and walk the whole ladder, metering the final fare.
    let (status, claimed) = app.claim(job_id, provider).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["outcome"], "won");
    assert_eq!(claimed["job"]["status"], "matched");

    for target in ["arriving", "picked_up", "in_progress"] {
        let (status, _) = app.advance(job_id, target).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, done) = app
        .post(
            &format!("/api/jobs/{}/advance", job_id),
            json!({
                "target": "completed",
                "fare": { "base_cents": 4_000, "distance_cents": 5_000, "time_cents": 3_000 },
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["status"], "completed");
    assert_eq!(done["final_price_cents"], 12_000);

    // The split: 20% ride commission on a 12,000 gross.
    let (_, record) = app.get(&format!("/api/jobs/{}/settlement", job_id)).await;
    assert_eq!(record["gross_cents"], 12_000);
    assert_eq!(record["commission_rate"], 0.2);
    assert_eq!(record["commission_cents"], 2_400);
    assert_eq!(record["worker_net_cents"], 9_600);

    // Metered fare ran above the hold, so the difference came from the
    // requester: 30,000 - 12,000.
    assert_eq!(app.balance("requester", requester).await, 18_000);
    assert_eq!(app.balance("provider", provider).await, 9_600);
    assert_eq!(app.balance("platform", Uuid::nil()).await, 2_400);
    assert_eq!(app.balance("escrow", Uuid::nil()).await, 0);

    // A tip lands on top, outside the commission.
    let (status, tipped) = app
        .post(&format!("/api/jobs/{}/tip", job_id), json!({ "amount_cents": 1_500 }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tipped["tip_cents"], 1_500);
    assert_eq!(app.balance("provider", provider).await, 11_100);
    assert_eq!(app.balance("requester", requester).await, 16_500);

    // The provider is free again and the counters reflect the outcome.
    let (_, body) = app.get("/api/status").await;
    assert_eq!(body["jobs"]["completed"], 1);
    assert_eq!(body["providers_online"], 1);
}

#[tokio::test]
async fn test_two_providers_race_for_one_job() {
    let app = TestApp::new().await;
    let requester = Uuid::new_v4();
    app.fund_requester(requester, 10_000).await;
    let job_id = app
        .create_job(requester, "delivery", 8_000, Some((40.01, -74.0)))
        .await;

    let first = app.register_provider(Some((40.0, -74.0))).await;
    let second = app.register_provider(Some((40.0, -74.01))).await;

    // Both see the same offer.
    for provider in [first, second] {
        let (_, ranked) = app.get(&format!("/api/providers/{}/jobs", provider)).await;
        assert_eq!(ranked.as_array().unwrap().len(), 1);
    }

    let (status, _) = app.claim(job_id, first).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app.claim(job_id, second).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "already_claimed");
    assert!(body["error"].as_str().unwrap().contains(&first.to_string()));

    // The loser's next scan no longer offers the job.
    let (_, ranked) = app.get(&format!("/api/providers/{}/jobs", second)).await;
    assert!(ranked.as_array().unwrap().is_empty());

    // The loser picks up other work unimpeded.
    let other = app
        .create_job(requester, "delivery", 2_000, Some((40.01, -74.01)))
        .await;
    let (status, _) = app.claim(other, second).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cancellation_story_returns_the_money() {
    let app = TestApp::new().await;
    let requester = Uuid::new_v4();
    app.fund_requester(requester, 9_000).await;
    let job_id = app.create_job(requester, "shopping", 9_000, None).await;
    let provider = app.register_provider(None).await;
    app.claim(job_id, provider).await;
    app.advance(job_id, "arriving").await;

    let (status, body) = app
        .post(
            &format!("/api/jobs/{}/cancel", job_id),
            json!({ "party": "requester", "reason": "changed my mind" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["cancelled_by"], "requester");
    assert_eq!(body["cancel_reason"], "changed my mind");

    // Pre-pickup cancellation: the full hold comes back, nobody is paid.
    assert_eq!(app.balance("requester", requester).await, 9_000);
    assert_eq!(app.balance("escrow", Uuid::nil()).await, 0);
    assert_eq!(app.balance("provider", provider).await, 0);
    assert_eq!(app.balance("platform", Uuid::nil()).await, 0);

    // The provider is released and can take the next job.
    let (_, listed) = app.get("/api/providers").await;
    let row = listed
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["id"] == provider.to_string())
        .unwrap();
    assert!(row["current_job"].is_null());

    let next = app.create_job(requester, "shopping", 4_000, None).await;
    let (status, _) = app.claim(next, provider).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_money_is_conserved_across_mixed_outcomes() {
    let app = TestApp::new().await;
    let requester = Uuid::new_v4();
    app.fund_requester(requester, 50_000).await;

    // One completed, one cancelled mid-flight, one still pending.
    let completed = app.create_job(requester, "ride", 10_000, None).await;
    let cancelled = app.create_job(requester, "delivery", 8_000, None).await;
    app.create_job(requester, "shopping", 5_000, None).await;

    let provider = app.register_provider(None).await;
    app.claim(completed, provider).await;
    app.run_to_completion(completed).await;
    app.post(
        &format!("/api/jobs/{}/tip", completed),
        json!({ "amount_cents": 2_000 }),
    )
    .await;

    app.claim(cancelled, provider).await;
    let (status, _) = app
        .post(
            &format!("/api/jobs/{}/cancel", cancelled),
            json!({ "party": "provider", "reason": "vehicle trouble" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Requester: 50,000 funded, 10,000 captured, 2,000 tipped, 5,000 still
    // held for the pending job.
    assert_eq!(app.balance("requester", requester).await, 33_000);
    assert_eq!(app.balance("escrow", Uuid::nil()).await, 5_000);
    assert_eq!(app.balance("provider", provider).await, 10_000);
    assert_eq!(app.balance("platform", Uuid::nil()).await, 2_000);

    // Everything in the system nets against the external leg.
    let internal = 33_000 + 5_000 + 10_000 + 2_000;
    assert_eq!(internal, 50_000);
}
