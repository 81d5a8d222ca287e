//! Escrow ledger for peer-to-peer wagers
//!
//! Every balance change is a [`WagerTransaction`] posted through
//! [`WagerLedger::post`]. All ledger operations run under one mutex, so two
//! postings can never read the same balance. Each operation checks all of its
//! preconditions before its first posting.

use crate::error::{MatchmakingError, Result};
use crate::matches::store::{require_match, MatchStore};
use crate::metrics::MetricsCollector;
use crate::types::{MatchId, WagerId};
use crate::users::{User, UserStore};
use crate::utils::{current_timestamp, generate_record_id, generate_wager_id};
use crate::wager::types::{
    CancelKind, LedgerAudit, Payout, RevenueStats, Stake, TransactionKind, Wager, WagerState,
    WagerStatus, WagerTransaction,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct LedgerBook {
    wagers: HashMap<WagerId, Wager>,
    transactions: Vec<WagerTransaction>,
}

pub struct WagerLedger {
    users: Arc<dyn UserStore>,
    matches: Arc<dyn MatchStore>,
    metrics: Arc<MetricsCollector>,
    fee_bps: u64,
    book: Mutex<LedgerBook>,
}

impl WagerLedger {
    pub fn new(
        users: Arc<dyn UserStore>,
        matches: Arc<dyn MatchStore>,
        metrics: Arc<MetricsCollector>,
        fee_bps: u64,
    ) -> Self {
        Self {
            users,
            matches,
            metrics,
            fee_bps,
            book: Mutex::new(LedgerBook::default()),
        }
    }

    pub fn fee_bps(&self) -> u64 {
        self.fee_bps
    }

    fn book(&self) -> Result<MutexGuard<'_, LedgerBook>> {
        self.book
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("wager ledger"))
    }

    /// Open a wager and lock the creator's stake
    pub fn create(&self, creator_id: &str, amount: u64, apply_fee: bool) -> Result<Wager> {
        if amount == 0 {
            return Err(MatchmakingError::InvalidWager {
                reason: "stake must be positive".to_string(),
            });
        }
        self.require_active_user(creator_id)?;

        let mut book = self.book()?;
        let wager = Wager {
            id: generate_wager_id(),
            creator: Stake {
                user_id: creator_id.to_string(),
                locked: amount,
            },
            opponent: None,
            amount,
            apply_fee,
            match_id: None,
            state: WagerState::Waiting,
            created_at: current_timestamp(),
        };
        self.post(&mut book, wager.id, creator_id, TransactionKind::Lock, amount)?;
        book.wagers.insert(wager.id, wager.clone());

        info!(
            "Wager {} opened by {} for {} (fee: {})",
            wager.id, creator_id, amount, apply_fee
        );
        Ok(wager)
    }

    /// Lock an equal stake from the opponent
    pub fn accept(&self, wager_id: WagerId, opponent_id: &str) -> Result<Wager> {
        self.require_active_user(opponent_id)?;

        let mut book = self.book()?;
        let wager = Self::wager_in(&book, wager_id)?;
        if wager.status() != WagerStatus::Waiting {
            return Err(wager.wrong_status("WAITING"));
        }
        if wager.creator.user_id == opponent_id {
            return Err(MatchmakingError::InvalidWager {
                reason: "cannot accept your own wager".to_string(),
            });
        }
        if let Some(match_id) = wager.match_id {
            self.check_sides(match_id, &wager.creator.user_id, Some(opponent_id))?;
        }

        self.post(
            &mut book,
            wager_id,
            opponent_id,
            TransactionKind::Lock,
            wager.amount,
        )?;
        let accepted = Self::commit(&mut book, wager_id, |w| {
            w.opponent = Some(Stake {
                user_id: opponent_id.to_string(),
                locked: w.amount,
            });
            w.state = WagerState::Locked;
        })?;

        info!(
            "Wager {} accepted by {}, pot {}",
            wager_id,
            opponent_id,
            accepted.total_pot()
        );
        Ok(accepted)
    }

    /// Tie an open wager to a match. Both sides must play on opposite teams.
    pub fn attach_match(&self, wager_id: WagerId, match_id: MatchId) -> Result<Wager> {
        let mut book = self.book()?;
        let wager = Self::wager_in(&book, wager_id)?;
        if wager.state.is_terminal() {
            return Err(wager.wrong_status("an open state"));
        }
        match wager.match_id {
            Some(existing) if existing == match_id => return Ok(wager),
            Some(existing) => {
                return Err(MatchmakingError::InvalidWager {
                    reason: format!("wager {} is already linked to match {}", wager_id, existing),
                })
            }
            None => {}
        }
        self.check_sides(match_id, &wager.creator.user_id, wager.opponent_id())?;

        let linked = Self::commit(&mut book, wager_id, |w| w.match_id = Some(match_id))?;
        debug!("Wager {} linked to match {}", wager_id, match_id);
        Ok(linked)
    }

    /// LOCKED -> LIVE
    pub fn start(&self, wager_id: WagerId) -> Result<Wager> {
        let mut book = self.book()?;
        let wager = Self::wager_in(&book, wager_id)?;
        if wager.status() != WagerStatus::Locked {
            return Err(wager.wrong_status("LOCKED"));
        }
        Self::commit(&mut book, wager_id, |w| w.state = WagerState::Live)
    }

    /// Move every locked wager of a match to LIVE
    pub fn start_for_match(&self, match_id: MatchId) -> Result<Vec<WagerId>> {
        let mut book = self.book()?;
        let mut started = Vec::new();
        for wager in book.wagers.values_mut() {
            if wager.match_id == Some(match_id) && wager.status() == WagerStatus::Locked {
                wager.state = WagerState::Live;
                started.push(wager.id);
            }
        }
        if !started.is_empty() {
            info!("{} wager(s) live with match {}", started.len(), match_id);
        }
        Ok(started)
    }

    /// Pay the pot, minus the platform fee, to the winner
    pub fn settle(&self, wager_id: WagerId, winner_id: &str, settled_by: &str) -> Result<Wager> {
        let mut book = self.book()?;
        let wager = Self::wager_in(&book, wager_id)?;
        match wager.status() {
            WagerStatus::Locked | WagerStatus::Live => {}
            _ => return Err(wager.wrong_status("LOCKED or LIVE")),
        }
        self.pay_out(&mut book, wager, winner_id, settled_by)
    }

    /// Operator decides the winner, also out of a dispute
    pub fn force_winner(&self, wager_id: WagerId, winner_id: &str, admin_id: &str) -> Result<Wager> {
        let mut book = self.book()?;
        let wager = Self::wager_in(&book, wager_id)?;
        match wager.status() {
            WagerStatus::Locked | WagerStatus::Live | WagerStatus::Disputed => {}
            _ => return Err(wager.wrong_status("LOCKED, LIVE or DISPUTED")),
        }
        warn!("Wager {} winner forced to {} by {}", wager_id, winner_id, admin_id);
        self.pay_out(&mut book, wager, winner_id, admin_id)
    }

    /// Creator takes back a wager nobody accepted
    pub fn withdraw(&self, wager_id: WagerId, user_id: &str) -> Result<Wager> {
        let mut book = self.book()?;
        let wager = Self::wager_in(&book, wager_id)?;
        if wager.creator.user_id != user_id {
            return Err(MatchmakingError::InvalidWager {
                reason: "only the creator can withdraw a wager".to_string(),
            });
        }
        if wager.status() != WagerStatus::Waiting {
            return Err(wager.wrong_status("WAITING"));
        }

        self.post(
            &mut book,
            wager_id,
            user_id,
            TransactionKind::Unlock,
            wager.creator.locked,
        )?;
        let withdrawn = Self::commit(&mut book, wager_id, |w| {
            w.state = WagerState::Cancelled {
                kind: CancelKind::Withdrawn,
                at: current_timestamp(),
                by: user_id.to_string(),
            }
        })?;
        info!("Wager {} withdrawn by its creator", wager_id);
        Ok(withdrawn)
    }

    /// Return every locked stake in full. No fee applies.
    pub fn cancel_and_refund(&self, wager_id: WagerId, by: &str) -> Result<Wager> {
        let mut book = self.book()?;
        let wager = Self::wager_in(&book, wager_id)?;
        if wager.state.is_terminal() {
            return Err(wager.wrong_status("an open state"));
        }

        let stakes: Vec<Stake> = std::iter::once(wager.creator.clone())
            .chain(wager.opponent.clone())
            .filter(|s| s.locked > 0)
            .collect();
        for stake in &stakes {
            self.require_user(&stake.user_id)?;
        }
        for stake in &stakes {
            self.post(
                &mut book,
                wager_id,
                &stake.user_id,
                TransactionKind::Refund,
                stake.locked,
            )?;
        }

        let refunded = Self::commit(&mut book, wager_id, |w| {
            w.state = WagerState::Cancelled {
                kind: CancelKind::Refunded,
                at: current_timestamp(),
                by: by.to_string(),
            }
        })?;
        info!(
            "Wager {} cancelled by {}, {} refunded",
            wager_id,
            by,
            refunded.total_pot()
        );
        Ok(refunded)
    }

    /// Freeze a wager for review. Stakes stay locked.
    pub fn mark_disputed(&self, wager_id: WagerId, by: &str, reason: &str) -> Result<Wager> {
        let mut book = self.book()?;
        let wager = Self::wager_in(&book, wager_id)?;
        match wager.status() {
            WagerStatus::Locked | WagerStatus::Live => {}
            _ => return Err(wager.wrong_status("LOCKED or LIVE")),
        }
        let disputed = Self::commit(&mut book, wager_id, |w| {
            w.state = WagerState::Disputed {
                at: current_timestamp(),
                by: by.to_string(),
                reason: reason.to_string(),
            }
        })?;
        warn!("Wager {} disputed by {}: {}", wager_id, by, reason);
        Ok(disputed)
    }

    pub fn get(&self, wager_id: WagerId) -> Result<Wager> {
        let book = self.book()?;
        Self::wager_in(&book, wager_id)
    }

    pub fn wagers_for_match(&self, match_id: MatchId) -> Result<Vec<Wager>> {
        let book = self.book()?;
        let mut found: Vec<Wager> = book
            .wagers
            .values()
            .filter(|w| w.match_id == Some(match_id))
            .cloned()
            .collect();
        found.sort_by_key(|w| w.created_at);
        Ok(found)
    }

    /// Postings of one user, oldest first
    pub fn transactions_for_user(&self, user_id: &str) -> Result<Vec<WagerTransaction>> {
        let book = self.book()?;
        Ok(book
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    pub fn transactions_for_wager(&self, wager_id: WagerId) -> Result<Vec<WagerTransaction>> {
        let book = self.book()?;
        Ok(book
            .transactions
            .iter()
            .filter(|t| t.wager_id == wager_id)
            .cloned()
            .collect())
    }

    pub fn revenue_stats(&self) -> Result<RevenueStats> {
        let book = self.book()?;
        let mut stats = RevenueStats::default();
        for wager in book.wagers.values() {
            match &wager.state {
                WagerState::Finished(payout) => {
                    stats.settled_wagers += 1;
                    stats.total_fees += payout.platform_fee;
                    stats.settled_volume += wager.total_pot();
                }
                WagerState::Cancelled { .. } => stats.cancelled_wagers += 1,
                WagerState::Disputed { .. } => stats.disputed_wagers += 1,
                WagerState::Waiting | WagerState::Locked | WagerState::Live => {
                    stats.open_wagers += 1
                }
            }
        }
        Ok(stats)
    }

    /// Replay a user's postings and check that they chain into the cached
    /// balance.
    pub fn verify_user_ledger(&self, user_id: &str) -> Result<LedgerAudit> {
        let book = self.book()?;
        let user = self.require_user(user_id)?;
        let postings: Vec<&WagerTransaction> = book
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .collect();

        let broken = |reason: String| {
            error!("Ledger check failed for {}: {}", user_id, reason);
            MatchmakingError::FinancialInvariant { reason }
        };

        let opening_balance = postings
            .first()
            .map(|t| t.balance_before)
            .unwrap_or(user.balance);
        let mut running = i128::from(opening_balance);
        let mut net_change = 0i128;
        for posting in &postings {
            if i128::from(posting.balance_before) != running {
                return Err(broken(format!(
                    "transaction {} starts at {} but the previous balance was {}",
                    posting.id, posting.balance_before, running
                )));
            }
            let delta = i128::from(posting.balance_after) - i128::from(posting.balance_before);
            if delta != posting.signed_amount() {
                return Err(broken(format!(
                    "transaction {} moves {} but records {} {}",
                    posting.id,
                    delta,
                    posting.kind.as_str(),
                    posting.amount
                )));
            }
            running = i128::from(posting.balance_after);
            net_change += posting.signed_amount();
        }
        if running != i128::from(user.balance) {
            return Err(broken(format!(
                "transactions end at {} but the balance is {}",
                running, user.balance
            )));
        }

        Ok(LedgerAudit {
            user_id: user_id.to_string(),
            transactions: postings.len(),
            net_change,
            opening_balance,
            balance: user.balance,
        })
    }

    fn pay_out(
        &self,
        book: &mut LedgerBook,
        wager: Wager,
        winner_id: &str,
        settled_by: &str,
    ) -> Result<Wager> {
        let loser_id = wager
            .counterpart(winner_id)
            .ok_or_else(|| MatchmakingError::InvalidWager {
                reason: format!("{} is not a side of wager {}", winner_id, wager.id),
            })?
            .to_string();
        Self::check_pot(&wager)?;
        let (platform_fee, winner_prize) = wager.payout_split(self.fee_bps)?;
        if winner_prize + platform_fee != wager.total_pot() || winner_prize > wager.total_pot() {
            return Err(MatchmakingError::FinancialInvariant {
                reason: format!(
                    "payout {} + fee {} does not match pot {}",
                    winner_prize,
                    platform_fee,
                    wager.total_pot()
                ),
            });
        }

        self.post(book, wager.id, winner_id, TransactionKind::Win, winner_prize)?;
        let settled = Self::commit(book, wager.id, |w| {
            w.state = WagerState::Finished(Payout {
                winner_id: winner_id.to_string(),
                loser_id: loser_id.clone(),
                platform_fee,
                winner_prize,
                settled_at: current_timestamp(),
                settled_by: settled_by.to_string(),
            })
        })?;
        self.metrics.record_wager_settled(platform_fee);
        info!(
            "Wager {} settled: {} wins {}, platform fee {}",
            wager.id, winner_id, winner_prize, platform_fee
        );
        Ok(settled)
    }

    /// Apply one balance change and append its transaction row
    fn post(
        &self,
        book: &mut LedgerBook,
        wager_id: WagerId,
        user_id: &str,
        kind: TransactionKind,
        amount: u64,
    ) -> Result<WagerTransaction> {
        let mut bracket = None;
        self.users.update(user_id, &mut |user| {
            let before = user.balance;
            let after = match kind {
                TransactionKind::Lock => before
                    .checked_sub(amount)
                    .ok_or(MatchmakingError::InsufficientBalance { required: amount })?,
                TransactionKind::Unlock | TransactionKind::Refund | TransactionKind::Win => before
                    .checked_add(amount)
                    .ok_or_else(|| MatchmakingError::FinancialInvariant {
                        reason: format!("balance overflow for {}", user_id),
                    })?,
            };
            user.balance = after;
            bracket = Some((before, after));
            Ok(())
        })?;
        let (balance_before, balance_after) =
            bracket.ok_or_else(|| MatchmakingError::InternalError {
                message: format!("posting for {} recorded no balance", user_id),
            })?;

        let posting = WagerTransaction {
            id: generate_record_id(),
            wager_id,
            user_id: user_id.to_string(),
            kind,
            amount,
            balance_before,
            balance_after,
            created_at: current_timestamp(),
        };
        book.transactions.push(posting.clone());
        self.metrics.record_ledger_posting(kind.as_str(), amount);
        info!(
            "Ledger {} {} for {} on wager {} ({} -> {})",
            kind.as_str(),
            amount,
            user_id,
            wager_id,
            balance_before,
            balance_after
        );
        Ok(posting)
    }

    fn wager_in(book: &LedgerBook, wager_id: WagerId) -> Result<Wager> {
        book.wagers
            .get(&wager_id)
            .cloned()
            .ok_or(MatchmakingError::WagerNotFound { wager_id })
    }

    fn commit(
        book: &mut LedgerBook,
        wager_id: WagerId,
        apply: impl FnOnce(&mut Wager),
    ) -> Result<Wager> {
        let wager = book
            .wagers
            .get_mut(&wager_id)
            .ok_or(MatchmakingError::WagerNotFound { wager_id })?;
        apply(wager);
        Ok(wager.clone())
    }

    fn check_pot(wager: &Wager) -> Result<()> {
        let expected = wager.amount * if wager.opponent.is_some() { 2 } else { 1 };
        if wager.total_pot() != expected {
            return Err(MatchmakingError::FinancialInvariant {
                reason: format!(
                    "wager {} holds {} but stakes add up to {}",
                    wager.id,
                    wager.total_pot(),
                    expected
                ),
            });
        }
        Ok(())
    }

    fn check_sides(&self, match_id: MatchId, creator: &str, opponent: Option<&str>) -> Result<()> {
        let linked = require_match(self.matches.as_ref(), match_id)?;
        if linked.is_terminal() {
            return Err(linked.wrong_state("an active state"));
        }
        let creator_side = linked.require_participant(creator)?;
        if let Some(opponent) = opponent {
            if linked.require_participant(opponent)? == creator_side {
                return Err(MatchmakingError::InvalidWager {
                    reason: format!("{} and {} play on the same team", creator, opponent),
                });
            }
        }
        Ok(())
    }

    fn require_user(&self, user_id: &str) -> Result<User> {
        self.users
            .get(user_id)?
            .ok_or_else(|| MatchmakingError::UserNotFound {
                user_id: user_id.to_string(),
            })
    }

    fn require_active_user(&self, user_id: &str) -> Result<()> {
        if self.require_user(user_id)?.is_banned {
            return Err(MatchmakingError::Banned {
                user_id: user_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matches::state::Match;
    use crate::matches::store::InMemoryMatchStore;
    use crate::types::GameMode;
    use crate::users::InMemoryUserStore;
    use chrono::{Duration, Utc};

    fn ledger() -> (WagerLedger, Arc<InMemoryUserStore>, Arc<InMemoryMatchStore>) {
        let users = Arc::new(InMemoryUserStore::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        for (id, balance) in [("x", 1000), ("y", 1000), ("z", 100)] {
            users
                .insert(User::new(id, 1000).with_balance(balance))
                .unwrap();
        }
        let ledger = WagerLedger::new(
            users.clone(),
            matches.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
            1000,
        );
        (ledger, users, matches)
    }

    fn balance(users: &InMemoryUserStore, id: &str) -> u64 {
        users.get(id).unwrap().unwrap().balance
    }

    #[test]
    fn test_settle_pays_prize_minus_fee() {
        let (ledger, users, _) = ledger();
        let wager = ledger.create("x", 500, true).unwrap();
        ledger.accept(wager.id, "y").unwrap();
        ledger.start(wager.id).unwrap();

        let settled = ledger.settle(wager.id, "x", "system").unwrap();
        match &settled.state {
            WagerState::Finished(payout) => {
                assert_eq!(payout.platform_fee, 100);
                assert_eq!(payout.winner_prize, 900);
                assert_eq!(payout.loser_id, "y");
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(balance(&users, "x"), 1400);
        assert_eq!(balance(&users, "y"), 500);

        let win = ledger
            .transactions_for_wager(wager.id)
            .unwrap()
            .into_iter()
            .find(|t| t.kind == TransactionKind::Win)
            .unwrap();
        assert_eq!((win.balance_before, win.balance_after), (500, 1400));
        assert_eq!(ledger.revenue_stats().unwrap().total_fees, 100);

        // settling twice is refused and moves nothing
        assert!(ledger.settle(wager.id, "x", "system").is_err());
        assert_eq!(balance(&users, "x"), 1400);
        ledger.verify_user_ledger("x").unwrap();
        ledger.verify_user_ledger("y").unwrap();
    }

    #[test]
    fn test_insufficient_balance_changes_nothing() {
        let (ledger, users, _) = ledger();
        assert_eq!(
            ledger.create("z", 500, true),
            Err(MatchmakingError::InsufficientBalance { required: 500 })
        );
        let wager = ledger.create("x", 500, true).unwrap();
        assert!(ledger.accept(wager.id, "z").is_err());
        assert_eq!(balance(&users, "z"), 100);
        assert_eq!(ledger.get(wager.id).unwrap().status(), WagerStatus::Waiting);
        assert!(ledger.transactions_for_user("z").unwrap().is_empty());
    }

    #[test]
    fn test_withdraw_and_refund() {
        let (ledger, users, _) = ledger();
        let open = ledger.create("x", 200, false).unwrap();
        assert!(ledger.withdraw(open.id, "y").is_err());
        ledger.withdraw(open.id, "x").unwrap();
        assert_eq!(balance(&users, "x"), 1000);

        let locked = ledger.create("x", 300, true).unwrap();
        ledger.accept(locked.id, "y").unwrap();
        ledger.mark_disputed(locked.id, "support", "score mismatch").unwrap();
        assert!(ledger.settle(locked.id, "x", "system").is_err());

        let refunded = ledger.cancel_and_refund(locked.id, "admin").unwrap();
        assert_eq!(refunded.status(), WagerStatus::Cancelled);
        assert_eq!(balance(&users, "x"), 1000);
        assert_eq!(balance(&users, "y"), 1000);
        let refunds = ledger
            .transactions_for_wager(locked.id)
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TransactionKind::Refund)
            .count();
        assert_eq!(refunds, 2);
        assert!(ledger.cancel_and_refund(locked.id, "admin").is_err());
    }

    #[test]
    fn test_force_winner_from_dispute() {
        let (ledger, users, _) = ledger();
        let wager = ledger.create("x", 100, false).unwrap();
        ledger.accept(wager.id, "y").unwrap();
        ledger.mark_disputed(wager.id, "support", "disconnect").unwrap();

        assert!(ledger.force_winner(wager.id, "z", "admin").is_err());
        let settled = ledger.force_winner(wager.id, "y", "admin").unwrap();
        match settled.state {
            WagerState::Finished(payout) => assert_eq!(payout.settled_by, "admin"),
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(balance(&users, "y"), 1100);
    }

    #[test]
    fn test_attach_requires_opposite_teams() {
        let (ledger, _, matches) = ledger();
        let now = Utc::now();
        let duel = Match::new(
            GameMode::OneVsOne,
            vec!["x".to_string()],
            vec!["y".to_string()],
            vec!["m".to_string()],
            vec!["l".to_string()],
            now,
            now + Duration::seconds(20),
        );
        let match_id = duel.id;
        matches.insert(duel).unwrap();

        let wager = ledger.create("x", 100, true).unwrap();
        ledger.attach_match(wager.id, match_id).unwrap();
        assert!(ledger.accept(wager.id, "z").is_err());
        ledger.accept(wager.id, "y").unwrap();
        assert_eq!(ledger.start_for_match(match_id).unwrap(), vec![wager.id]);
        assert_eq!(ledger.wagers_for_match(match_id).unwrap().len(), 1);
    }

    #[test]
    fn test_verify_detects_outside_balance_write() {
        let (ledger, users, _) = ledger();
        ledger.create("x", 100, true).unwrap();
        assert_eq!(ledger.verify_user_ledger("x").unwrap().net_change, -100);

        users
            .update("x", &mut |u| {
                u.balance += 5;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            ledger.verify_user_ledger("x"),
            Err(MatchmakingError::FinancialInvariant { .. })
        ));
    }
}
