/// Block reward split
///
/// Amounts are integer PASC minor units. Worker shares of a block are floored,
/// so a split never hands out more than the block reward; the remainder stays
/// with the pool.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::blockchain::rpc_client::to_units;

/// Rewards derived from a daemon block, before the pool fee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReward {
    /// Block reward plus fees minus the dev fee
    pub reward: i64,
    /// Block reward minus the dev fee, credited as PASA balance
    pub pasa_reward: i64,
}

impl BlockReward {
    pub fn from_chain(reward: Decimal, fee: Decimal, dev_fee_units: i64) -> Self {
        Self {
            reward: to_units(reward) + to_units(fee) - dev_fee_units,
            pasa_reward: to_units(reward) - dev_fee_units,
        }
    }
}

/// `floor(amount - amount * pool_fee / 100)`, never negative
pub fn after_pool_fee(amount: i64, pool_fee_percent: f64) -> i64 {
    let amount = amount as f64;
    (amount - amount * pool_fee_percent / 100.0).floor().max(0.0) as i64
}

/// One worker's cut of a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub amount: i64,
    pub pasa: i64,
    pub percent: f64,
}

/// Splits both rewards proportionally to round weight.
pub fn split_rewards(
    reward: i64,
    pasa_reward: i64,
    round: &HashMap<String, i64>,
    total_shares: i64,
) -> BTreeMap<String, Credit> {
    if total_shares <= 0 {
        return BTreeMap::new();
    }
    let portion = |amount: i64, weight: i64| -> i64 {
        (i128::from(amount.max(0)) * i128::from(weight) / i128::from(total_shares)) as i64
    };

    round
        .iter()
        .filter(|(_, weight)| **weight > 0)
        .map(|(worker, &weight)| {
            let credit = Credit {
                amount: portion(reward, weight),
                pasa: portion(pasa_reward, weight),
                percent: weight as f64 / total_shares as f64,
            };
            (worker.clone(), credit)
        })
        .collect()
}
