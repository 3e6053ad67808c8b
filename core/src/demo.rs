//! Deterministic synthetic networks for demos and determinism tests.
//!
//! RULE: Nothing here calls a platform RNG. A network is a pure function
//! of (seed, participant count, period), so the same inputs always seed
//! the same rows and therefore the same commissions and Merkle root.
//!
//! Placement fills the binary tree breadth-first: user i sits under
//! i / 2, left when i is even. Leg volumes are the subtree sales plus
//! any ghost and carry-forward volume, as the purchase flow would leave them.

use crate::{
    error::CommissionResult,
    period::PeriodKey,
    store::{
        BinaryNodeRow, GhostVolumeRow, ParticipantRow, SettlementStore, TransactionRow,
        VolumeRecordRow,
    },
    types::{Leg, UserId},
};
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

const SECONDS_PER_DAY: i64 = 86_400;
const RANKS: [(&str, f64); 3] = [("bronze", 2_000.0), ("silver", 10_000.0), ("gold", 25_000.0)];

/// Seeded RNG stream for demo data.
pub struct DemoRng {
    inner: Pcg64Mcg,
}

impl DemoRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n). Returns 0 when n is 0.
    pub fn below(&mut self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Simplified Pareto draw: most sales small, a few large.
    pub fn pareto(&mut self, x_min: f64, alpha: f64) -> f64 {
        let u = self.next_f64().max(1e-10);
        x_min * u.powf(-1.0 / alpha)
    }

    pub fn wallet(&mut self) -> String {
        let mut bytes = [0u8; 20];
        self.inner.fill_bytes(&mut bytes);
        format!("0x{}", hex::encode(bytes))
    }
}

fn cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemoNetwork {
    pub period:         PeriodKey,
    pub participants:   Vec<ParticipantRow>,
    pub transactions:   Vec<TransactionRow>,
    pub nodes:          Vec<BinaryNodeRow>,
    pub ghost_volumes:  Vec<GhostVolumeRow>,
    pub volume_records: Vec<VolumeRecordRow>,
    pub rank_caps:      Vec<(String, f64)>,
}

impl DemoNetwork {
    pub fn generate(seed: u64, participants: usize, period: PeriodKey) -> Self {
        let mut rng = DemoRng::new(seed);
        let n = participants.max(1) as UserId;
        let period_key = period.to_string();
        let start = period.unix_timestamp();
        let week = crate::period::PERIOD_DAYS * SECONDS_PER_DAY;

        let mut rows = Vec::with_capacity(n as usize);
        for user_id in 1..=n {
            let (sponsor_id, binary_parent_id, binary_position) = if user_id == 1 {
                (None, None, None)
            } else {
                let sponsor = 1 + rng.below((user_id - 1) as u64) as UserId;
                let leg = if user_id % 2 == 0 { Leg::Left } else { Leg::Right };
                (Some(sponsor), Some(user_id / 2), Some(leg))
            };
            let wallet_address = if rng.chance(0.05) {
                None
            } else if let (true, Some(sponsor)) = (rng.chance(0.02), sponsor_id) {
                // Family accounts paid to the sponsor's wallet.
                rows.iter()
                    .find(|p: &&ParticipantRow| p.user_id == sponsor)
                    .and_then(|p| p.wallet_address.clone())
            } else {
                Some(rng.wallet())
            };
            let rank = RANKS[rng.below(RANKS.len() as u64) as usize].0.to_string();
            rows.push(ParticipantRow {
                user_id,
                sponsor_id,
                binary_parent_id,
                binary_position,
                wallet_address,
                rank: Some(rank),
            });
        }

        let mut own_sales = vec![0.0f64; n as usize + 1];
        let mut transactions = Vec::new();
        for user_id in 1..=n {
            if !rng.chance(0.7) {
                continue;
            }
            for k in 0..1 + rng.below(3) {
                let amount = cents(rng.pareto(20.0, 1.8).min(5_000.0));
                let eligible = rng.chance(0.95);
                if eligible {
                    own_sales[user_id as usize] += amount;
                }
                transactions.push(TransactionRow {
                    tx_id: format!("demo-{period_key}-{user_id}-{k}"),
                    user_id,
                    amount,
                    period_key: period_key.clone(),
                    eligible,
                    created_at: start + rng.below(week as u64) as i64,
                });
            }
        }

        // Subtree sales, bottom-up over the breadth-first layout.
        let mut subtree = own_sales.clone();
        for user_id in (1..=n).rev() {
            let parent = user_id / 2;
            if parent >= 1 {
                subtree[parent as usize] += subtree[user_id as usize];
            }
        }
        let child = |id: UserId| (id <= n).then_some(id);
        let mut nodes: Vec<BinaryNodeRow> = (1..=n)
            .map(|user_id| {
                let left = child(user_id * 2);
                let right = child(user_id * 2 + 1);
                BinaryNodeRow {
                    user_id,
                    left_leg_id: left,
                    right_leg_id: right,
                    left_volume: cents(left.map_or(0.0, |c| subtree[c as usize])),
                    right_volume: cents(right.map_or(0.0, |c| subtree[c as usize])),
                }
            })
            .collect();

        let ttl = 10 * SECONDS_PER_DAY;
        let mut ghost_volumes = Vec::new();
        let mut volume_records = Vec::new();
        for node in nodes.iter_mut() {
            let leg = if rng.chance(0.5) { Leg::Left } else { Leg::Right };
            if rng.chance(0.03) {
                let amount = cents(100.0 + rng.next_f64() * 400.0);
                let created_at = start - rng.below(14) as i64 * SECONDS_PER_DAY;
                *leg_volume(node, leg) += amount;
                ghost_volumes.push(GhostVolumeRow {
                    ghost_id: format!("ghost-{period_key}-{}", node.user_id),
                    user_id: node.user_id,
                    pay_leg: leg,
                    amount,
                    created_at,
                    expires_at: created_at + ttl,
                    status: "active".to_string(),
                });
            }
            if rng.chance(0.05) {
                let carry = cents(50.0 + rng.next_f64() * 950.0);
                *leg_volume(node, leg) += carry;
                volume_records.push(VolumeRecordRow {
                    record_id: format!("carry-{period_key}-{}", node.user_id),
                    user_id: node.user_id,
                    leg,
                    amount: carry,
                    carry_forward: carry,
                    created_at: start - rng.below(365) as i64 * SECONDS_PER_DAY,
                    flushed_at: None,
                });
            }
        }

        Self {
            period,
            participants: rows,
            transactions,
            nodes,
            ghost_volumes,
            volume_records,
            rank_caps: RANKS.iter().map(|(r, c)| (r.to_string(), *c)).collect(),
        }
    }

    pub fn write_to(&self, store: &SettlementStore) -> CommissionResult<()> {
        for (rank, cap) in &self.rank_caps {
            store.upsert_rank_cap(rank, *cap)?;
        }
        for p in &self.participants {
            store.upsert_participant(p)?;
        }
        for t in &self.transactions {
            store.insert_transaction(t)?;
        }
        let updated_at = self.period.unix_timestamp();
        for node in &self.nodes {
            store.upsert_binary_node(node, updated_at)?;
        }
        for g in &self.ghost_volumes {
            store.insert_ghost_volume(g)?;
        }
        for r in &self.volume_records {
            store.insert_volume_record(r)?;
        }
        log::info!(
            "demo network for {}: {} participants, {} transactions, {} ghost rows",
            self.period,
            self.participants.len(),
            self.transactions.len(),
            self.ghost_volumes.len()
        );
        Ok(())
    }

    pub fn sales_volume(&self) -> f64 {
        self.transactions
            .iter()
            .filter(|t| t.eligible)
            .map(|t| t.amount)
            .sum()
    }
}

fn leg_volume(node: &mut BinaryNodeRow, leg: Leg) -> &mut f64 {
    match leg {
        Leg::Left => &mut node.left_volume,
        Leg::Right => &mut node.right_volume,
    }
}
