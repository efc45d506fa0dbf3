//! Schema-level tests: identity enforcement, result-code extensions,
//! history redaction and the live-update subscription.

use std::sync::Arc;

use async_graphql::{Request, Variables};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

use api::auth::Identity;
use api::ApiService;
use engine::{AuctionParams, Clock, Engine, EngineConfig, LotParams, PlaceBidRequest};
use shared::types::{LotId, PremiumTier, Role, UserId};

const T0: i64 = 1_700_000_000;

fn service_with_lot() -> (ApiService, Arc<Engine>, LotId) {
    let engine = Arc::new(Engine::new(Clock::manual(T0), EngineConfig::default()));
    let auction = engine
        .create_auction(AuctionParams {
            title: "API test sale".into(),
            start_at: T0,
            end_at: T0 + 3_600,
            soft_close_enabled: false,
            trigger_window: 300,
            extension: 300,
            increment_rules: None,
            premium_rules: vec![PremiumTier {
                min: Decimal::ZERO,
                max: None,
                rate: Decimal::new(15, 2),
            }],
            tax_rate: None,
        })
        .unwrap();
    let lot = engine
        .add_lot(
            auction.id,
            LotParams {
                lot_number: 1,
                title: "Walnut desk".into(),
                description: None,
                category: None,
                condition: None,
                starting_bid: Decimal::from(10),
                reserve_price: None,
                buy_now_price: None,
                increment_rules_override: None,
                shipping_amount: None,
                quantity: None,
                location: None,
                shipping_available: false,
                tags: Vec::new(),
            },
        )
        .unwrap();
    engine.publish_auction(auction.id).unwrap();
    engine.activate_auction(auction.id).unwrap();
    let service = ApiService::new(Arc::clone(&engine));
    (service, engine, lot.id)
}

fn bidder(role: Role) -> Identity {
    Identity {
        user_id: Uuid::new_v4(),
        role,
    }
}

fn place_bid_request(lot_id: LotId, amount: &str, max: Option<&str>) -> Request {
    Request::new(
        r#"mutation($input: PlaceBidInput!) {
            placeBid(input: $input) {
                success resultCode proxyTriggered outbidOccurred
                lot { currentBid bidCount }
                minNextBid message
            }
        }"#,
    )
    .variables(Variables::from_json(json!({
        "input": {
            "lotId": lot_id,
            "amount": amount,
            "maxBid": max,
        }
    })))
}

fn data_json(response: &async_graphql::Response) -> Value {
    serde_json::to_value(&response.data).unwrap()
}

fn first_error_json(response: &async_graphql::Response) -> Value {
    serde_json::to_value(&response.errors[0]).unwrap()
}

#[tokio::test]
async fn bidding_without_identity_is_unauthorized() {
    let (service, _engine, lot_id) = service_with_lot();
    let response = service
        .handle_query(place_bid_request(lot_id, "10", None))
        .await;
    assert_eq!(response.errors.len(), 1);
    let error = first_error_json(&response);
    assert_eq!(error["extensions"]["code"], "UNAUTHORIZED");
    assert_eq!(error["extensions"]["http_status"], 401);
}

#[tokio::test]
async fn guests_may_not_bid() {
    let (service, _engine, lot_id) = service_with_lot();
    let response = service
        .handle_query(place_bid_request(lot_id, "10", None).data(bidder(Role::Guest)))
        .await;
    let error = first_error_json(&response);
    assert_eq!(error["extensions"]["code"], "FORBIDDEN");
    assert_eq!(error["extensions"]["http_status"], 403);
}

#[tokio::test]
async fn accepted_bid_returns_the_fresh_snapshot() {
    let (service, _engine, lot_id) = service_with_lot();
    let response = service
        .handle_query(place_bid_request(lot_id, "10", None).data(bidder(Role::Bidder)))
        .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    let data = data_json(&response);
    assert_eq!(data["placeBid"]["success"], true);
    assert_eq!(data["placeBid"]["resultCode"], "OK");
    assert_eq!(data["placeBid"]["lot"]["bidCount"], 1);
}

#[tokio::test]
async fn policy_rejections_carry_the_stable_code() {
    let (service, _engine, lot_id) = service_with_lot();
    let identity = bidder(Role::Bidder);
    service
        .handle_query(place_bid_request(lot_id, "10", None).data(identity))
        .await;

    let response = service
        .handle_query(place_bid_request(lot_id, "11", None).data(bidder(Role::Bidder)))
        .await;
    let error = first_error_json(&response);
    assert_eq!(error["extensions"]["code"], "BID_TOO_LOW");
    assert_eq!(error["extensions"]["http_status"], 400);
}

#[tokio::test]
async fn outbid_by_proxy_is_a_payload_not_an_error() {
    let (service, engine, lot_id) = service_with_lot();
    let holder = bidder(Role::Bidder);
    engine
        .place_bid(PlaceBidRequest {
            lot_id,
            bidder_id: holder.user_id,
            amount: Decimal::from(10),
            max_bid: Some(Decimal::from(100)),
            ip_address: None,
            user_agent: None,
        })
        .await
        .unwrap();

    let response = service
        .handle_query(place_bid_request(lot_id, "15", None).data(bidder(Role::Bidder)))
        .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    let data = data_json(&response);
    assert_eq!(data["placeBid"]["success"], false);
    assert_eq!(data["placeBid"]["resultCode"], "OUTBID_BY_PROXY");
    assert_eq!(data["placeBid"]["proxyTriggered"], true);
}

#[tokio::test]
async fn bid_history_redacts_identities_for_ordinary_viewers() {
    let (service, engine, lot_id) = service_with_lot();
    let (alice, bob) = (bidder(Role::Bidder), bidder(Role::Bidder));
    for (who, amount) in [(&alice, 10i64), (&bob, 15), (&alice, 20)] {
        engine
            .place_bid(PlaceBidRequest {
                lot_id,
                bidder_id: who.user_id,
                amount: Decimal::from(amount),
                max_bid: None,
                ip_address: None,
                user_agent: None,
            })
            .await
            .unwrap();
    }

    let query = Request::new(
        r#"query($lotId: UUID!) {
            bidHistory(lotId: $lotId) { amount bidderId bidderAlias }
        }"#,
    )
    .variables(Variables::from_json(json!({ "lotId": lot_id })));

    // Alice sees herself, but Bob only as an alias.
    let response = service
        .handle_query(
            Request::new(query.query.clone())
                .variables(Variables::from_json(json!({ "lotId": lot_id })))
                .data(alice.clone()),
        )
        .await;
    let rows = &data_json(&response)["bidHistory"];
    assert_eq!(rows[0]["bidderId"], json!(alice.user_id));
    assert_eq!(rows[1]["bidderId"], Value::Null);
    assert_eq!(rows[1]["bidderAlias"], "Bidder 2");
    assert_eq!(rows[2]["bidderAlias"], "Bidder 1");

    // Staff see everyone.
    let response = service
        .handle_query(
            Request::new(query.query.clone())
                .variables(Variables::from_json(json!({ "lotId": lot_id })))
                .data(bidder(Role::Staff)),
        )
        .await;
    let rows = &data_json(&response)["bidHistory"];
    assert_eq!(rows[1]["bidderId"], json!(bob.user_id));
}

#[tokio::test]
async fn subscription_starts_with_a_snapshot_frame() {
    let (service, _engine, lot_id) = service_with_lot();
    let request = Request::new(
        r#"subscription($lotId: UUID!) {
            lotFeed(lotId: $lotId) { kind at lot { currentBid } }
        }"#,
    )
    .variables(Variables::from_json(json!({ "lotId": lot_id })));

    let mut stream = service.handle_subscription(request);
    let first = stream.next().await.unwrap();
    assert!(first.errors.is_empty(), "{:?}", first.errors);
    let data = data_json(&first);
    assert_eq!(data["lotFeed"]["kind"], "SNAPSHOT");
}

#[tokio::test]
async fn unknown_lot_subscription_is_not_found() {
    let (service, _engine, _lot_id) = service_with_lot();
    let request = Request::new(
        r#"subscription($lotId: UUID!) {
            lotFeed(lotId: $lotId) { kind }
        }"#,
    )
    .variables(Variables::from_json(json!({ "lotId": Uuid::new_v4() })));

    let mut stream = service.handle_subscription(request);
    let first = stream.next().await.unwrap();
    let error = first_error_json(&first);
    assert_eq!(error["extensions"]["code"], "NOT_FOUND");
    assert_eq!(error["extensions"]["http_status"], 404);
}

#[tokio::test]
async fn bid_rate_limit_applies_per_identity() {
    let engine = Arc::new(Engine::new(
        Clock::manual(T0),
        EngineConfig {
            rate_limit_max: 1,
            ..EngineConfig::default()
        },
    ));
    let auction = engine
        .create_auction(AuctionParams {
            title: "Throttled sale".into(),
            start_at: T0,
            end_at: T0 + 3_600,
            soft_close_enabled: false,
            trigger_window: 300,
            extension: 300,
            increment_rules: None,
            premium_rules: Vec::new(),
            tax_rate: None,
        })
        .unwrap();
    let lot = engine
        .add_lot(
            auction.id,
            LotParams {
                lot_number: 1,
                title: "Clock".into(),
                description: None,
                category: None,
                condition: None,
                starting_bid: Decimal::from(10),
                reserve_price: None,
                buy_now_price: None,
                increment_rules_override: None,
                shipping_amount: None,
                quantity: None,
                location: None,
                shipping_available: false,
                tags: Vec::new(),
            },
        )
        .unwrap();
    engine.publish_auction(auction.id).unwrap();
    engine.activate_auction(auction.id).unwrap();
    let service = ApiService::new(Arc::clone(&engine));

    let hasty = bidder(Role::Bidder);
    let calm = bidder(Role::Bidder);
    let first = service
        .handle_query(place_bid_request(lot.id, "10", None).data(hasty.clone()))
        .await;
    assert!(first.errors.is_empty(), "{:?}", first.errors);

    let second = service
        .handle_query(place_bid_request(lot.id, "15", None).data(hasty))
        .await;
    let error = first_error_json(&second);
    assert_eq!(error["extensions"]["code"], "TRANSIENT_CONFLICT");
    assert_eq!(error["extensions"]["http_status"], 503);

    // Another identity still has budget.
    let third = service
        .handle_query(place_bid_request(lot.id, "15", None).data(calm))
        .await;
    assert!(third.errors.is_empty(), "{:?}", third.errors);
}

#[tokio::test]
async fn admin_close_flow_over_graphql() {
    let (service, engine, lot_id) = service_with_lot();
    let winner: UserId = Uuid::new_v4();
    engine
        .place_bid(PlaceBidRequest {
            lot_id,
            bidder_id: winner,
            amount: Decimal::from(10),
            max_bid: None,
            ip_address: None,
            user_agent: None,
        })
        .await
        .unwrap();
    engine.clock().advance_secs(4_000);

    let request = Request::new(
        r#"mutation($lotId: UUID!) {
            closeLot(lotId: $lotId) { status currentBidderId }
        }"#,
    )
    .variables(Variables::from_json(json!({ "lotId": lot_id })));

    // Staff is not enough.
    let response = service
        .handle_query(
            Request::new(request.query.clone())
                .variables(Variables::from_json(json!({ "lotId": lot_id })))
                .data(bidder(Role::Staff)),
        )
        .await;
    assert_eq!(
        first_error_json(&response)["extensions"]["code"],
        "FORBIDDEN"
    );

    let response = service
        .handle_query(
            Request::new(request.query.clone())
                .variables(Variables::from_json(json!({ "lotId": lot_id })))
                .data(bidder(Role::Admin)),
        )
        .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    let data = data_json(&response);
    assert_eq!(data["closeLot"]["status"], "SOLD");
    assert_eq!(data["closeLot"]["currentBidderId"], json!(winner));
}
