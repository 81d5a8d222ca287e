//! Integration tests for the matchforge engine
//!
//! Drive whole match lifecycles through the public engine API:
//! - queue, confirmation and veto
//! - provisioning, including concurrent and failing requests
//! - ingestion ticks from warmup to a settled result
//! - wager escrow, payouts and refunds
//! - operator actions and their authorization

mod fixtures;

use chrono::{Duration, Utc};
use fixtures::{steam_id, FeedSpec, TestHarness, ADMIN, SUPPORT};
use matchforge::error::MatchmakingError;
use matchforge::history::{InMemoryHistoryStore, MatchHistory, MatchHistoryStore};
use matchforge::ingestion::TickOutcome;
use matchforge::matches::{
    CancelReason, ConfirmOutcome, Match, MatchPhase, MatchStateKind, ProvisioningStatus,
};
use matchforge::matches::store::transition;
use matchforge::settlement::SettlementOutcome;
use matchforge::types::{GameMode, MatchId, PlayerAction, PlayerCommand, TeamSide, VetoKind};
use matchforge::wager::{Wager, WagerLedger, WagerStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn create_5v5(h: &TestHarness, prefix: &str) -> Match {
    for i in 0..10 {
        let user = format!("{}{}", prefix, i);
        h.seed_user(&user, 10_000);
        h.engine.queue().join(&user, GameMode::FiveVsFive).await.unwrap();
    }
    h.engine
        .matchmaker()
        .run_once(GameMode::FiveVsFive)
        .await
        .unwrap()
        .expect("ten queued players should pair")
}

fn command(user: &str, action: PlayerAction) -> PlayerCommand {
    PlayerCommand {
        user_id: user.to_string(),
        action,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_commands_drive_match_from_queue_to_warmup() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);

    for user in ["alice", "bob"] {
        h.engine
            .execute(command(
                user,
                PlayerAction::JoinQueue {
                    mode: GameMode::OneVsOne,
                },
            ))
            .await
            .unwrap();
    }
    assert_eq!(h.engine.run_matchmaking().await.unwrap(), 1);
    assert_eq!(h.engine.queue().count_by_mode(GameMode::OneVsOne).unwrap(), 0);

    let created = h
        .engine
        .matches()
        .active_match_for("alice")
        .unwrap()
        .expect("alice has a match");
    assert_eq!(created.state(), MatchStateKind::Confirming);

    for user in ["alice", "bob"] {
        h.engine
            .execute(command(
                user,
                PlayerAction::Confirm {
                    match_id: created.id,
                },
            ))
            .await
            .unwrap();
    }
    assert_eq!(h.get_match(created.id).state(), MatchStateKind::Veto);

    // team B may not open either pool
    let captain_b = created.team_b[0].clone();
    let early = h
        .engine
        .execute(command(
            &captain_b,
            PlayerAction::Ban {
                match_id: created.id,
                kind: VetoKind::Map,
                item: "de_dust2".to_string(),
            },
        ))
        .await;
    assert_eq!(early, Err(MatchmakingError::NotYourTurn));

    let captain_a = created.team_a[0].clone();
    for (kind, item) in [(VetoKind::Map, "de_dust2"), (VetoKind::Location, "london")] {
        h.engine
            .execute(command(
                &captain_a,
                PlayerAction::Ban {
                    match_id: created.id,
                    kind,
                    item: item.to_string(),
                },
            ))
            .await
            .unwrap();
    }

    // veto completion provisions in the background
    let warming = h.wait_for_state(created.id, MatchStateKind::Warmup).await;
    h.engine.ingestion().stop(created.id);
    let setup = warming.setup().unwrap();
    assert_eq!(setup.map, "de_mirage");
    assert_eq!(setup.location, "frankfurt");
    assert_eq!(h.provider.servers_created(), 1);
    assert_eq!(
        h.publisher.match_event_names(),
        vec![
            "created",
            "confirmed",
            "banned",
            "banned",
            "veto_completed",
            "server_ready"
        ]
    );
}

#[tokio::test]
async fn test_decline_cancels_and_frees_players() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    let created = h.create_1v1("alice", "bob").await;

    h.engine.matches().confirm(created.id, "alice").await.unwrap();
    h.engine.matches().decline(created.id, "bob").await.unwrap();

    let cancelled = h.get_match(created.id);
    assert!(matches!(
        cancelled.phase,
        MatchPhase::Cancelled {
            reason: CancelReason::Declined { .. },
            ..
        }
    ));
    assert!(h.engine.matches().active_match_for("alice").unwrap().is_none());
    h.engine.queue().join("alice", GameMode::OneVsOne).await.unwrap();
}

#[tokio::test]
async fn test_unconfirmed_match_expires() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    let created = h.create_1v1("alice", "bob").await;
    h.engine.matches().confirm(created.id, "alice").await.unwrap();

    let expired = h
        .engine
        .matches()
        .expire_confirmations(Utc::now() + Duration::seconds(21))
        .await
        .unwrap();
    assert_eq!(expired, vec![created.id]);
    assert!(matches!(
        h.get_match(created.id).phase,
        MatchPhase::Cancelled {
            reason: CancelReason::ConfirmationTimeout,
            ..
        }
    ));
}

#[tokio::test]
async fn test_parallel_provisioning_creates_one_server() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    h.provider
        .delay_creates(std::time::Duration::from_millis(50));
    let created = h.create_1v1("alice", "bob").await;
    h.to_configuring(&created).await;

    let coordinator = h.engine.provisioning().clone();
    let match_id = created.id;
    let responses = futures::future::join_all((0..5).map(|i| {
        let coordinator = coordinator.clone();
        let user = if i % 2 == 0 { "alice" } else { "bob" };
        async move { coordinator.request_provisioning(match_id, user).await }
    }))
    .await;
    h.engine.ingestion().stop(created.id);

    let responses: Vec<_> = responses.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(responses.iter().filter(|r| r.success).count(), 1);
    assert!(responses
        .iter()
        .filter(|r| !r.success)
        .all(|r| r.reason.as_deref() == Some("already_provisioning")));
    assert_eq!(h.provider.servers_created(), 1);
    assert_eq!(h.get_match(created.id).state(), MatchStateKind::Warmup);
}

#[tokio::test]
async fn test_failed_provisioning_releases_lock() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    let created = h.create_1v1("alice", "bob").await;
    h.to_configuring(&created).await;

    h.provider.fail_creates("out of capacity");
    let failed = h.engine.provisioning().provision(created.id).await;
    assert!(matches!(
        failed,
        Err(MatchmakingError::ExternalProvider { .. })
    ));
    assert!(matches!(
        h.get_match(created.id).phase,
        MatchPhase::Configuring {
            provisioning: ProvisioningStatus::NotStarted,
            ..
        }
    ));
}

#[tokio::test]
async fn test_outsider_cannot_request_provisioning() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    h.seed_user("mallory", 0);
    let created = h.create_1v1("alice", "bob").await;
    h.to_configuring(&created).await;

    let denied = h
        .engine
        .provisioning()
        .request_provisioning(created.id, "mallory")
        .await;
    assert!(matches!(
        denied,
        Err(MatchmakingError::NotParticipant { .. })
    ));
    assert_eq!(h.provider.servers_created(), 0);
}

#[tokio::test]
async fn test_ingestion_takes_match_from_warmup_to_settled() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    let created = h.create_1v1("alice", "bob").await;
    h.to_warmup(&created).await;
    let job = h.engine.ingestion().job().clone();
    let winner = created.team_a[0].clone();
    let loser = created.team_b[0].clone();

    // nobody connected yet
    h.set_feed(&created, FeedSpec::warmup(false));
    assert_eq!(job.tick(created.id).await.unwrap(), TickOutcome::Continue);
    assert_eq!(h.get_match(created.id).state(), MatchStateKind::Warmup);

    h.set_feed(&created, FeedSpec::warmup(true));
    assert_eq!(job.tick(created.id).await.unwrap(), TickOutcome::Continue);
    assert_eq!(h.get_match(created.id).state(), MatchStateKind::Live);

    h.set_feed(&created, FeedSpec::finished(13, 7));
    assert_eq!(job.tick(created.id).await.unwrap(), TickOutcome::Done);

    let finished = h.get_match(created.id);
    let result = finished.result().unwrap();
    assert_eq!(result.winner, TeamSide::A);
    assert_eq!((result.score_a, result.score_b), (13, 7));
    assert_eq!(result.mvp.as_deref(), Some(winner.as_str()));
    assert_eq!(h.elo(&winner, GameMode::OneVsOne), 1016);
    assert_eq!(h.elo(&loser, GameMode::OneVsOne), 984);

    let history = h.engine.history().user_history(&winner, 0, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].won);
    assert_eq!(history[0].elo_change, Some(16));
    assert_eq!(h.provider.deleted_servers(), vec!["srv-1".to_string()]);
    assert_eq!(h.publisher.count("live"), 1);
    assert_eq!(h.publisher.count("finished"), 1);
}

#[tokio::test]
async fn test_settlement_runs_once() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    let created = h.create_1v1("alice", "bob").await;
    h.to_warmup(&created).await;
    let job = h.engine.ingestion().job().clone();

    h.set_feed(&created, FeedSpec::warmup(true));
    job.tick(created.id).await.unwrap();
    h.set_feed(&created, FeedSpec::finished(7, 13));
    job.tick(created.id).await.unwrap();
    let winner = created.team_b[0].clone();
    let rated = h.elo(&winner, GameMode::OneVsOne);

    // retried poll, then an operator racing it
    assert_eq!(job.tick(created.id).await.unwrap(), TickOutcome::Done);
    let again = h
        .engine
        .settlement()
        .settle_finished(created.id, None)
        .await
        .unwrap();
    assert_eq!(again, SettlementOutcome::AlreadySettled);
    let forced = h
        .engine
        .admin()
        .force_finish_match(ADMIN, created.id, TeamSide::A)
        .await
        .unwrap();
    assert_eq!(forced, SettlementOutcome::AlreadySettled);

    assert_eq!(h.elo(&winner, GameMode::OneVsOne), rated);
    assert_eq!(h.get_match(created.id).result().unwrap().winner, TeamSide::B);
    assert_eq!(h.publisher.count("finished"), 1);
    assert_eq!(
        h.engine.history().user_history(&winner, 0, 10).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_level_score_waits_for_operator() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    let created = h.create_1v1("alice", "bob").await;
    h.to_warmup(&created).await;
    let job = h.engine.ingestion().job().clone();

    h.set_feed(&created, FeedSpec::warmup(true));
    job.tick(created.id).await.unwrap();
    h.set_feed(&created, FeedSpec::finished(10, 10));
    assert_eq!(job.tick(created.id).await.unwrap(), TickOutcome::Done);
    assert_eq!(h.get_match(created.id).state(), MatchStateKind::Live);

    let outcome = h
        .engine
        .admin()
        .force_finish_match(ADMIN, created.id, TeamSide::B)
        .await
        .unwrap();
    match outcome {
        SettlementOutcome::Settled(report) => {
            assert_eq!(report.winner, TeamSide::B);
            assert_eq!(report.forced_by.as_deref(), Some(ADMIN));
        }
        other => panic!("expected a settlement, got {:?}", other),
    }
    assert_eq!(
        h.engine
            .admin()
            .audit_trail(&created.id.to_string())
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_wager_pays_winner_minus_fee() {
    let h = TestHarness::new();
    h.seed_user("alice", 5_000);
    h.seed_user("bob", 5_000);
    let created = h.create_1v1("alice", "bob").await;
    h.to_warmup(&created).await;
    let job = h.engine.ingestion().job().clone();
    let creator = created.team_a[0].clone();
    let opponent = created.team_b[0].clone();

    let ledger = h.engine.ledger();
    let wager = ledger.create(&creator, 500, true).unwrap();
    ledger.accept(wager.id, &opponent).unwrap();
    ledger.attach_match(wager.id, created.id).unwrap();
    assert_eq!(h.balance(&creator), 4_500);
    assert_eq!(h.balance(&opponent), 4_500);

    h.set_feed(&created, FeedSpec::warmup(true));
    job.tick(created.id).await.unwrap();
    assert_eq!(ledger.get(wager.id).unwrap().status(), WagerStatus::Live);

    h.set_feed(&created, FeedSpec::finished(16, 4));
    job.tick(created.id).await.unwrap();

    let settled = ledger.get(wager.id).unwrap();
    assert_eq!(settled.status(), WagerStatus::Finished);
    assert_eq!(h.balance(&creator), 5_400);
    assert_eq!(h.balance(&opponent), 4_500);

    let revenue = ledger.revenue_stats().unwrap();
    assert_eq!(revenue.total_fees, 100);
    assert_eq!(revenue.settled_wagers, 1);
    for user in [&creator, &opponent] {
        ledger.verify_user_ledger(user).unwrap();
    }
    assert_eq!(h.publisher.count("wager_settled"), 1);
}

#[tokio::test]
async fn test_absent_player_cancels_and_refunds_without_rating_change() {
    let h = TestHarness::new();
    h.seed_user("alice", 2_000);
    h.seed_user("bob", 2_000);
    let created = h.create_1v1("alice", "bob").await;
    h.to_warmup(&created).await;
    let job = h.engine.ingestion().job().clone();
    let creator = created.team_a[0].clone();
    let opponent = created.team_b[0].clone();

    let ledger = h.engine.ledger();
    let wager = ledger.create(&creator, 250, true).unwrap();
    ledger.accept(wager.id, &opponent).unwrap();
    ledger.attach_match(wager.id, created.id).unwrap();

    let warming = h.get_match(created.id);
    let outcome = job
        .observe(&warming, Utc::now() + Duration::seconds(301))
        .await
        .unwrap();
    assert_eq!(outcome, TickOutcome::Done);

    match h.get_match(created.id).phase {
        MatchPhase::Cancelled {
            reason: CancelReason::PlayerAbsent { missing },
            ..
        } => assert_eq!(missing.len(), 2),
        other => panic!("expected a cancellation, got {:?}", other),
    }
    assert_eq!(ledger.get(wager.id).unwrap().status(), WagerStatus::Cancelled);
    assert_eq!(h.balance(&creator), 2_000);
    assert_eq!(h.balance(&opponent), 2_000);
    assert_eq!(h.elo(&creator, GameMode::OneVsOne), 1000);
    assert_eq!(h.elo(&opponent, GameMode::OneVsOne), 1000);
    assert_eq!(h.provider.deleted_servers(), vec!["srv-1".to_string()]);
}

#[tokio::test]
async fn test_operator_actions_require_capability() {
    let h = TestHarness::new();
    h.seed_user("alice", 1_000);
    h.seed_user("bob", 1_000);
    let created = h.create_1v1("alice", "bob").await;
    h.to_warmup(&created).await;
    let admin = h.engine.admin();

    for actor in [SUPPORT, "alice"] {
        let denied = admin
            .force_finish_match(actor, created.id, TeamSide::A)
            .await;
        assert!(matches!(denied, Err(MatchmakingError::Unauthorized { .. })));
    }
    assert_eq!(h.get_match(created.id).state(), MatchStateKind::Warmup);
    assert!(admin
        .audit_trail(&created.id.to_string())
        .unwrap()
        .is_empty());

    let ledger = h.engine.ledger();
    let wager = ledger.create("alice", 100, false).unwrap();
    ledger.accept(wager.id, "bob").unwrap();
    let disputed = admin
        .mark_wager_disputed(SUPPORT, wager.id, "score mismatch")
        .await
        .unwrap();
    assert_eq!(disputed.status(), WagerStatus::Disputed);
    assert!(matches!(
        admin.force_wager_winner(SUPPORT, wager.id, "bob").await,
        Err(MatchmakingError::Unauthorized { .. })
    ));

    let paid = admin.force_wager_winner(ADMIN, wager.id, "bob").await.unwrap();
    assert_eq!(paid.status(), WagerStatus::Finished);
    assert_eq!(h.balance("bob"), 1_100);
    assert_eq!(h.balance("alice"), 900);
    assert_eq!(admin.audit_trail(&wager.id.to_string()).unwrap().len(), 2);
}

#[tokio::test]
async fn test_operator_cancel_stops_ingestion() {
    let h = TestHarness::new();
    h.seed_user("alice", 0);
    h.seed_user("bob", 0);
    let created = h.create_1v1("alice", "bob").await;
    h.to_configuring(&created).await;
    h.engine.provisioning().provision(created.id).await.unwrap();
    assert!(h.engine.ingestion().is_tracking(created.id));

    let cancelled = h
        .engine
        .admin()
        .cancel_match(ADMIN, created.id)
        .await
        .unwrap();
    assert_eq!(cancelled.state(), MatchStateKind::Cancelled);
    assert!(!h.engine.ingestion().is_tracking(created.id));
    assert_eq!(h.provider.deleted_servers(), vec!["srv-1".to_string()]);
}

#[tokio::test]
async fn test_party_queues_onto_one_team() {
    let h = TestHarness::new();
    for i in 0..10 {
        h.seed_user(&format!("p{}", i), 0);
    }
    h.seed_party("p0", &["p1", "p2"]);

    let queued = h.engine.queue().join("p0", GameMode::FiveVsFive).await.unwrap();
    assert_eq!(queued.len(), 3);
    assert!(matches!(
        h.engine.queue().join("p1", GameMode::FiveVsFive).await,
        Err(MatchmakingError::NotPartyLeader { .. })
    ));
    for i in 3..10 {
        h.engine
            .queue()
            .join(&format!("p{}", i), GameMode::FiveVsFive)
            .await
            .unwrap();
    }

    let created = h
        .engine
        .matchmaker()
        .run_once(GameMode::FiveVsFive)
        .await
        .unwrap()
        .expect("ten players should pair");
    let side = created.side_of("p0").unwrap();
    for member in ["p1", "p2"] {
        assert_eq!(created.side_of(member), Some(side));
    }
    assert_eq!(created.team_a.len(), 5);
    assert_eq!(created.team_b.len(), 5);
}

#[tokio::test]
async fn test_roster_uses_linked_identity() {
    let h = TestHarness::new();
    let alice = h.seed_user("alice", 0);
    assert_eq!(alice.steam_id, Some(steam_id("alice")));
    let found = h
        .engine
        .stores()
        .users
        .find_by_steam_id(&steam_id("alice"))
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "alice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_confirmations_transition_once() {
    let h = TestHarness::new();
    for round in 0..10 {
        let created = create_5v5(&h, &format!("r{}p", round)).await;
        let match_id = created.id;
        let handles: Vec<_> = created
            .participant_ids()
            .into_iter()
            .map(|user| {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.matches().confirm(match_id, &user).await })
            })
            .collect();
        let outcomes: Vec<ConfirmOutcome> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == ConfirmOutcome::Transitioned)
                .count(),
            1
        );
        assert_eq!(h.get_match(created.id).state(), MatchStateKind::Veto);
    }
    assert_eq!(h.publisher.count("confirmed"), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_turn_bans_accept_one() {
    let h = TestHarness::new();
    let created = create_5v5(&h, "b").await;
    for user in created.participant_ids() {
        h.engine.matches().confirm(created.id, &user).await.unwrap();
    }

    let match_id = created.id;
    let handles: Vec<_> = [(0, "de_dust2"), (1, "de_mirage")]
        .into_iter()
        .map(|(captain, item)| {
            let engine = h.engine.clone();
            let user = created.team_a[captain].clone();
            tokio::spawn(async move {
                engine
                    .matches()
                    .ban(match_id, &user, VetoKind::Map, item)
                    .await
            })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.publisher.count("banned"), 1);
    match h.get_match(created.id).phase {
        MatchPhase::Veto(veto) => assert_eq!(veto.maps.banned().len(), 1),
        other => panic!("expected veto, got {:?}", other),
    }
}

/// Even rounds are opened by the whale, odd ones accepted by it; every
/// fourth is refunded and the rest go to the whale
fn play_wager(ledger: &WagerLedger, round: usize) -> matchforge::Result<Wager> {
    let rival = format!("rival{}", round);
    let wager = if round % 2 == 0 {
        let opened = ledger.create("whale", 1_000, true)?;
        ledger.accept(opened.id, &rival)?
    } else {
        let opened = ledger.create(&rival, 1_000, true)?;
        ledger.accept(opened.id, "whale")?
    };
    if round % 4 == 0 {
        ledger.cancel_and_refund(wager.id, "system")
    } else {
        ledger.settle(wager.id, "whale", "system")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_postings_keep_ledger_chained() {
    let h = TestHarness::new();
    h.seed_user("whale", 100_000);
    for i in 0..8 {
        h.seed_user(&format!("rival{}", i), 10_000);
    }

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = h.engine.clone();
            tokio::spawn(async move { play_wager(engine.ledger(), i) })
        })
        .collect();
    for joined in futures::future::join_all(handles).await {
        joined.unwrap().unwrap();
    }

    let audit = h.engine.ledger().verify_user_ledger("whale").unwrap();
    assert_eq!(audit.transactions, 8 + 8);
    assert_eq!(audit.balance, h.balance("whale"));
    // six settled pots of 2000 pay 1800 each, two wagers refunded
    assert_eq!(h.balance("whale"), 100_000 + 6 * 800);
    assert_eq!(h.engine.ledger().revenue_stats().unwrap().total_fees, 6 * 200);
}

#[tokio::test]
async fn test_unpayable_wager_is_flagged_for_review() {
    let h = TestHarness::new();
    h.seed_user("alice", 5_000);
    h.seed_user("bob", 5_000);
    h.seed_user("carol", 0);
    let created = h.create_1v1("alice", "bob").await;
    h.to_warmup(&created).await;
    let creator = created.team_a[0].clone();
    let opponent = created.team_b[0].clone();

    let ledger = h.engine.ledger();
    let wager = ledger.create(&creator, 500, true).unwrap();
    ledger.accept(wager.id, &opponent).unwrap();
    ledger.attach_match(wager.id, created.id).unwrap();

    // a substitute replaces the opponent, so neither wager side wins
    transition(h.engine.stores().matches.as_ref(), created.id, |m| {
        m.team_b = vec!["carol".to_string()];
        Ok(())
    })
    .unwrap();

    let outcome = h
        .engine
        .admin()
        .force_finish_match(ADMIN, created.id, TeamSide::B)
        .await
        .unwrap();
    let report = match outcome {
        SettlementOutcome::Settled(report) => report,
        other => panic!("expected a settlement, got {:?}", other),
    };
    assert_eq!(report.wagers_failed, vec![wager.id]);
    assert!(report.wager_payouts.is_empty());

    assert_eq!(ledger.get(wager.id).unwrap().status(), WagerStatus::Disputed);
    assert_eq!(h.balance(&creator), 4_500);
    assert_eq!(h.balance(&opponent), 4_500);
    assert_eq!(ledger.revenue_stats().unwrap().disputed_wagers, 1);
    assert_eq!(h.publisher.count("wager_settled"), 0);
}

/// History store whose first inserts fail
struct FlakyHistory {
    inner: InMemoryHistoryStore,
    failures_left: AtomicUsize,
}

impl MatchHistoryStore for FlakyHistory {
    fn insert(&self, history: MatchHistory) -> matchforge::Result<bool> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MatchmakingError::InternalError {
                message: "history store unavailable".to_string(),
            });
        }
        self.inner.insert(history)
    }

    fn get(&self, match_id: MatchId) -> matchforge::Result<Option<MatchHistory>> {
        self.inner.get(match_id)
    }

    fn for_user(&self, user_id: &str) -> matchforge::Result<Vec<MatchHistory>> {
        self.inner.for_user(user_id)
    }
}

#[tokio::test]
async fn test_failed_follow_up_resumes_on_retry() {
    let h = TestHarness::with_history(Arc::new(FlakyHistory {
        inner: InMemoryHistoryStore::new(),
        failures_left: AtomicUsize::new(1),
    }));
    h.seed_user("alice", 5_000);
    h.seed_user("bob", 5_000);
    let created = h.create_1v1("alice", "bob").await;
    h.to_warmup(&created).await;
    let winner = created.team_a[0].clone();
    let loser = created.team_b[0].clone();

    let ledger = h.engine.ledger();
    let wager = ledger.create(&winner, 500, true).unwrap();
    ledger.accept(wager.id, &loser).unwrap();
    ledger.attach_match(wager.id, created.id).unwrap();

    let admin = h.engine.admin();
    let failed = admin
        .force_finish_match(ADMIN, created.id, TeamSide::A)
        .await;
    assert!(matches!(failed, Err(MatchmakingError::InternalError { .. })));
    assert_eq!(h.get_match(created.id).state(), MatchStateKind::Finished);
    assert!(h.engine.stores().history.get(created.id).unwrap().is_none());
    assert_eq!(ledger.get(wager.id).unwrap().status(), WagerStatus::Locked);
    let rated = h.elo(&winner, GameMode::OneVsOne);
    assert!(rated > 1000);

    for _ in 0..2 {
        let retried = admin
            .force_finish_match(ADMIN, created.id, TeamSide::A)
            .await
            .unwrap();
        assert_eq!(retried, SettlementOutcome::AlreadySettled);
    }

    let games = h
        .engine
        .stores()
        .users
        .get(&winner)
        .unwrap()
        .unwrap()
        .games_played(GameMode::OneVsOne);
    assert_eq!(games, 1);
    assert_eq!(h.elo(&winner, GameMode::OneVsOne), rated);
    let history = h.engine.stores().history.get(created.id).unwrap().unwrap();
    assert_eq!(history.winner, TeamSide::A);
    assert_eq!(history.rating_changes.len(), 2);
    assert_eq!(ledger.get(wager.id).unwrap().status(), WagerStatus::Finished);
    assert_eq!(h.publisher.count("finished"), 1);
    assert_eq!(h.publisher.count("wager_settled"), 1);
}
