//! Aggregation over the tip collection
//!
//! All results are immutable snapshots computed from a consistent read of
//! the collection; cancelled tips stay in the totals and are visible in the
//! per-state breakdown.

use std::collections::HashMap;

use agentpay_types::Tip;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How many repositories the global ranking reports
pub const GLOBAL_TOP_REPOS: usize = 10;

/// Count and sum for one token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub count: usize,
    pub total: Decimal,
}

/// Aggregate for one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoStats {
    pub repo: String,
    pub count: usize,
    pub total: Decimal,
    pub average: Decimal,
    pub by_token: HashMap<String, TokenBucket>,
    pub by_state: HashMap<String, usize>,
}

/// One repository's rank entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoTotal {
    pub repo: String,
    pub count: usize,
    pub total: Decimal,
}

/// Aggregate for one tipper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TipperStats {
    pub tipper: String,
    pub count: usize,
    pub total: Decimal,
    pub top_repos: Vec<RepoTotal>,
}

/// System-wide aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_tips: usize,
    pub total_amount: Decimal,
    pub by_token: HashMap<String, TokenBucket>,
    pub top_repos: Vec<RepoTotal>,
}

pub(crate) fn repo_stats<'a>(repo: &str, tips: impl Iterator<Item = &'a Tip>) -> RepoStats {
    let mut stats = RepoStats {
        repo: repo.to_string(),
        count: 0,
        total: Decimal::ZERO,
        average: Decimal::ZERO,
        by_token: HashMap::new(),
        by_state: HashMap::new(),
    };

    for tip in tips.filter(|t| t.repo.to_string() == repo) {
        stats.count += 1;
        stats.total += tip.amount;
        let bucket = stats
            .by_token
            .entry(tip.token.as_str().to_string())
            .or_default();
        bucket.count += 1;
        bucket.total += tip.amount;
        *stats.by_state.entry(tip.state.as_str().to_string()).or_default() += 1;
    }

    if stats.count > 0 {
        stats.average = stats.total / Decimal::from(stats.count as u64);
    }
    stats
}

pub(crate) fn tipper_stats<'a>(
    tipper: &str,
    top_n: usize,
    tips: impl Iterator<Item = &'a Tip>,
) -> TipperStats {
    let mut count = 0;
    let mut total = Decimal::ZERO;
    let mut per_repo: HashMap<String, RepoTotal> = HashMap::new();

    for tip in tips.filter(|t| t.tipper == tipper) {
        count += 1;
        total += tip.amount;
        let repo = tip.repo.to_string();
        let entry = per_repo.entry(repo.clone()).or_insert_with(|| RepoTotal {
            repo,
            count: 0,
            total: Decimal::ZERO,
        });
        entry.count += 1;
        entry.total += tip.amount;
    }

    TipperStats {
        tipper: tipper.to_string(),
        count,
        total,
        top_repos: rank(per_repo, top_n),
    }
}

pub(crate) fn global_stats<'a>(tips: impl Iterator<Item = &'a Tip>) -> GlobalStats {
    let mut total_tips = 0;
    let mut total_amount = Decimal::ZERO;
    let mut by_token: HashMap<String, TokenBucket> = HashMap::new();
    let mut per_repo: HashMap<String, RepoTotal> = HashMap::new();

    for tip in tips {
        total_tips += 1;
        total_amount += tip.amount;
        let bucket = by_token.entry(tip.token.as_str().to_string()).or_default();
        bucket.count += 1;
        bucket.total += tip.amount;

        let repo = tip.repo.to_string();
        let entry = per_repo.entry(repo.clone()).or_insert_with(|| RepoTotal {
            repo,
            count: 0,
            total: Decimal::ZERO,
        });
        entry.count += 1;
        entry.total += tip.amount;
    }

    GlobalStats {
        total_tips,
        total_amount,
        by_token,
        top_repos: rank(per_repo, GLOBAL_TOP_REPOS),
    }
}

/// Rank repositories by summed amount, name as the deterministic tiebreak
fn rank(per_repo: HashMap<String, RepoTotal>, top_n: usize) -> Vec<RepoTotal> {
    let mut ranked: Vec<RepoTotal> = per_repo.into_values().collect();
    ranked.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.repo.cmp(&b.repo)));
    ranked.truncate(top_n);
    ranked
}
