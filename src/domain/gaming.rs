//! Gaming: bets and wins
//!
//! Every bet or win records the player's game balance as it stands after the
//! transfer, optionally including a linked transit account
//! (`misc.transit_account`) that mirrors funds held by a game provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use super::{Domain, XferContext};
use crate::account::AccountId;
use crate::amount::distribute_win;
use crate::limits::LimitDomain;
use crate::xfer::{LedgerTx, XferEngine, XferError, XferRecord, XferRequest, make_ext_id};

pub const BET: &str = "Bet";
pub const WIN: &str = "Win";

const TRANSIT_ACCOUNT: &str = "transit_account";
const GAME_BALANCE: &str = "game_balance";

pub(super) async fn db_step(
    tx: &mut dyn LedgerTx,
    ctx: &XferContext<'_>,
    misc: &mut Map<String, Value>,
) -> Result<(), XferError> {
    let player_balance = match ctx.xfer_type {
        BET => ctx.src.available() - ctx.src_amount,
        WIN => ctx.dst.available() + ctx.dst_amount,
        _ => return Ok(()),
    };

    let transit = match ctx.misc.get(TRANSIT_ACCOUNT).and_then(Value::as_str) {
        Some(id) => {
            let id = AccountId::new(id);
            tx.fetch_accounts(std::slice::from_ref(&id))
                .await?
                .first()
                .map(|acct| acct.available())
                .ok_or_else(|| XferError::UnknownAccountID(id.to_string()))?
        }
        None => Decimal::ZERO,
    };

    misc.insert(
        GAME_BALANCE.into(),
        Value::String((player_balance + transit).to_string()),
    );
    Ok(())
}

/// Request builders for game rounds
pub struct GamingService {
    engine: Arc<XferEngine>,
}

impl GamingService {
    pub fn new(engine: Arc<XferEngine>) -> Self {
        Self { engine }
    }

    pub async fn bet(
        &self,
        player: &AccountId,
        house: &AccountId,
        currency: &str,
        amount: &str,
        round_id: &str,
    ) -> Result<XferRecord, XferError> {
        let req = XferRequest::new(Domain::Gaming, BET, player.clone(), house.clone(), currency, amount)
            .with_ext_id(make_ext_id(player, round_id))
            .with_src_limit(LimitDomain::Gaming, "bet");
        self.engine.process_xfer(&req).await
    }

    pub async fn win(
        &self,
        house: &AccountId,
        player: &AccountId,
        currency: &str,
        amount: &str,
        round_id: &str,
    ) -> Result<XferRecord, XferError> {
        let req = XferRequest::new(Domain::Gaming, WIN, house.clone(), player.clone(), currency, amount)
            .with_ext_id(make_ext_id(player, round_id))
            .with_dst_limit(LimitDomain::Gaming, "win");
        self.engine.process_xfer(&req).await
    }

    /// Pay a win across several player accounts (main, bonus, ...) in
    /// proportion to `shares`. Each part is its own transfer with an
    /// external id derived from `round_id` and the receiving account, so a
    /// retried split replays part by part.
    pub async fn win_split(
        &self,
        house: &AccountId,
        shares: &BTreeMap<AccountId, Decimal>,
        currency: &str,
        total: Decimal,
        places: u32,
        round_id: &str,
    ) -> Result<Vec<XferRecord>, XferError> {
        let weights: BTreeMap<String, Decimal> = shares
            .iter()
            .map(|(acct, w)| (acct.to_string(), *w))
            .collect();
        let parts = distribute_win(&weights, total, places)?;

        let mut records = Vec::with_capacity(parts.len());
        for (acct, part) in parts {
            if part.is_zero() {
                continue;
            }
            let player = AccountId::new(acct);
            let record = self
                .win(house, &player, currency, &part.to_string(), round_id)
                .await?;
            records.push(record);
        }
        Ok(records)
    }
}
