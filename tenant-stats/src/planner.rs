//! Dispatch pickup planner
//!
//! Decides how many queued jobs to pull for each tenant in one worker cycle,
//! balancing each tenant's observed arrival rate against the pool's wall-clock
//! budget, then spending any leftover budget on queued pile-up.
//!
//! The planner is a pure function over a snapshot of the statistics registry:
//! it never consults live state, never blocks, and never fails. A tenant with
//! missing statistics simply contributes zero.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Headroom multiplier applied to the router timeout. Planning against the
/// exact deadline turns every cycle into a catch-up scenario; the extra 30%
/// also leaves room for the pile-up pass.
const TIMEOUT_BOOST: f64 = 1.3;

/// A tenant is deprioritized while its last drain lies within this many
/// router-timeout intervals.
const DRAIN_PENALTY_CYCLES: u32 = 10;

/// Snapshot of everything the planner needs for one destination type.
///
/// All maps are keyed by tenant. Rates are jobs per second, latencies are
/// seconds per job; both are moving-average values captured at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct PickupInputs {
    /// Tenants ordered ascending by observed processing latency. Tenants
    /// absent from this list are not planned for.
    pub sorted_latency_list: Vec<String>,
    /// Oldest pending job per tenant. Carried for observability; the current
    /// algorithm does not consult it.
    pub earliest_job_map: HashMap<String, DateTime<Utc>>,
    /// Size of the worker pool the picked jobs will be spread over.
    pub workers: usize,
    /// Soft deadline for one dispatch cycle.
    pub router_timeout: std::time::Duration,
    /// Upper bound on the total number of jobs picked this cycle.
    pub job_query_batch_size: usize,
    /// Moving-average seconds per job, per tenant.
    pub latency: HashMap<String, f64>,
    /// Moving-average jobs per second arriving, per tenant.
    pub in_rate: HashMap<String, f64>,
    /// Cached pending-job counts, per tenant.
    pub pending: HashMap<String, i64>,
    /// Fraction of deliveries that succeeded last cycle, per tenant.
    pub success_rate: HashMap<String, f64>,
    /// Fraction of deliveries that were drained last cycle, per tenant.
    pub drained: HashMap<String, f64>,
    /// When each tenant last had a job drained.
    pub last_drained: HashMap<String, DateTime<Utc>>,
    /// Planning instant; lets callers replay historical snapshots.
    pub now: DateTime<Utc>,
}

/// Computes the number of jobs to pick per tenant.
///
/// Two passes over the tenants, cheapest-latency first, recently-drained
/// tenants moved to the back:
///
/// 1. **In-rate pass** — each tenant is offered its arrival rate times the
///    (boosted) timeout, capped by the remaining wall-clock budget divided by
///    its latency and by its pending count. Tenants whose rate or latency is
///    too unreliable to size a pickup get a probe of one job that does not
///    consume the time budget. Once either budget runs out, tenants with
///    pending jobs still get a single job so nobody starves.
/// 2. **Pile-up pass** — leftover job and time budget is spent draining
///    pending counts in the same order, each tenant bounded by what its
///    latency says fits in the remaining wall-clock.
///
/// The sum of the returned picks never exceeds `job_query_batch_size`, and
/// the estimated wall-clock (pick × latency, excluding probe picks) never
/// exceeds `workers × 1.3 × router_timeout`.
pub fn plan_pickup(inputs: &PickupInputs) -> HashMap<String, usize> {
    let timeout_secs = inputs.router_timeout.as_secs_f64();
    let boosted_timeout_secs = TIMEOUT_BOOST * timeout_secs;

    let mut running_job_count = inputs.job_query_batch_size as i64;
    let mut running_time_counter = inputs.workers as f64 * boosted_timeout_secs;

    // Recently-drained tenants go to the back of the line and plan against the
    // unboosted timeout, so tenants whose jobs are currently being dropped do
    // not crowd out healthy ones.
    let drain_penalty =
        chrono::Duration::from_std(inputs.router_timeout.saturating_mul(DRAIN_PENALTY_CYCLES))
            .unwrap_or(chrono::Duration::MAX);
    let mut ordered: Vec<(&str, bool)> = Vec::with_capacity(inputs.sorted_latency_list.len());
    let mut deprioritized: Vec<(&str, bool)> = Vec::new();
    for tenant in &inputs.sorted_latency_list {
        let recently_drained = inputs
            .last_drained
            .get(tenant)
            .is_some_and(|at| inputs.now.signed_duration_since(*at) < drain_penalty);
        if recently_drained {
            deprioritized.push((tenant, true));
        } else {
            ordered.push((tenant, false));
        }
    }
    ordered.extend(deprioritized);

    let mut plan: HashMap<String, usize> = HashMap::new();

    // Pass 1: in-rate.
    for &(tenant, deprioritized) in &ordered {
        let pending = inputs.pending.get(tenant).copied().unwrap_or(0);

        if running_job_count <= 0 || running_time_counter <= 0.0 {
            // Budget exhausted; tenants with work still get one job each so a
            // slow cycle cannot starve them forever.
            if pending > 0 {
                plan.insert(tenant.to_owned(), 1);
            }
            continue;
        }

        let time_given = if deprioritized {
            timeout_secs
        } else {
            boosted_timeout_secs
        };
        let rate = inputs.in_rate.get(tenant).copied().unwrap_or(0.0);
        let latency = inputs.latency.get(tenant).copied().unwrap_or(0.0);

        let mut unreliable = false;
        let mut pick: i64;
        if latency > 0.0 {
            pick = f64::min(rate * time_given, running_time_counter / latency) as i64;
            if pick < 1 {
                // Rate or latency too far off to size a pickup; probe with a
                // single job and leave the time budget untouched.
                tracing::debug!(tenant, rate, latency, "unreliable latency or in-rate");
                pick = 1;
                unreliable = true;
            }
        } else {
            // No latency observation yet for this tenant.
            pick = (rate * time_given) as i64;
        }
        pick = pick.min(pending.max(0)).min(running_job_count);

        let time_required = if unreliable { 0.0 } else { pick as f64 * latency };
        running_time_counter -= time_required;
        running_job_count -= pick;
        if pick > 0 {
            plan.insert(tenant.to_owned(), pick as usize);
        }
        tracing::debug!(
            tenant,
            pick,
            time_required,
            remaining_time = running_time_counter,
            remaining_jobs = running_job_count,
            "in-rate pass"
        );
    }

    // Pass 2: pile-up.
    for &(tenant, _) in &ordered {
        if running_job_count <= 0 || running_time_counter <= 0.0 {
            break;
        }
        let pending = inputs.pending.get(tenant).copied().unwrap_or(0);
        if pending <= 0 {
            continue;
        }
        let latency = inputs.latency.get(tenant).copied().unwrap_or(0.0);
        let already = plan.get(tenant).copied().unwrap_or(0) as i64;

        let time_required = latency * pending as f64;
        let pick = if time_required < running_time_counter {
            i64::min(pending - already, running_job_count)
        } else {
            // time_required >= running_time_counter > 0 implies latency > 0.
            let by_time = (running_time_counter / latency) as i64;
            by_time.min(running_job_count).min(pending - already)
        };
        if pick > 0 {
            *plan.entry(tenant.to_owned()).or_insert(0) += pick as usize;
            running_job_count -= pick;
            running_time_counter -= pick as f64 * latency;
        }
        tracing::debug!(
            tenant,
            pick,
            remaining_time = running_time_counter,
            remaining_jobs = running_job_count,
            "pile-up pass"
        );
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(tenants: &[(&str, f64, f64, i64)]) -> PickupInputs {
        let mut inputs = PickupInputs {
            sorted_latency_list: tenants.iter().map(|(t, ..)| t.to_string()).collect(),
            workers: 1,
            router_timeout: std::time::Duration::from_secs(1),
            job_query_batch_size: 100,
            now: Utc::now(),
            ..Default::default()
        };
        for &(tenant, latency, rate, pending) in tenants {
            inputs.latency.insert(tenant.to_owned(), latency);
            inputs.in_rate.insert(tenant.to_owned(), rate);
            inputs.pending.insert(tenant.to_owned(), pending);
        }
        inputs
    }

    #[test]
    fn fast_tenant_fills_the_budget_slow_tenant_keeps_a_probe() {
        // A: 0.1s latency, 10 jobs/s, 50 pending. B: 1s latency, 1 job/s,
        // 5 pending. One worker with a 1s timeout plans 1.3s of wall-clock:
        // A gets min(10 * 1.3, 1.3 / 0.1) = 13 and exhausts the time budget,
        // so B falls into the starvation reserve and gets exactly 1.
        let plan = plan_pickup(&inputs(&[("A", 0.1, 10.0, 50), ("B", 1.0, 1.0, 5)]));
        assert_eq!(plan.get("A"), Some(&13));
        assert_eq!(plan.get("B"), Some(&1));

        let total: usize = plan.values().sum();
        assert!(total <= 100);
        // A is the only tenant that consumed wall-clock budget.
        assert!(13.0 * 0.1 <= 1.0 * 1.3 + f64::EPSILON);
    }

    #[test]
    fn total_picks_never_exceed_the_batch_size() {
        // A's rate-driven candidate (1000 jobs/s over 1.3s) dwarfs the batch
        // size; the pick must be capped at the remaining job budget.
        let plan = plan_pickup(&inputs(&[
            ("A", 0.001, 1000.0, 10_000),
            ("B", 0.001, 1000.0, 0),
        ]));
        let total: usize = plan.values().sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn pile_up_pass_spends_leftover_budget() {
        // One quiet tenant with a big backlog: pass 1 sizes the pickup from
        // the (low) in-rate, pass 2 drains the backlog up to the time budget.
        let plan = plan_pickup(&inputs(&[("A", 0.25, 2.0, 500)]));
        // Pass 1: min(2 * 1.3, 1.3 / 0.25) floors to 2, spending 0.5s.
        // Pass 2: floor(0.8s / 0.25) = 3 more.
        assert_eq!(plan.get("A"), Some(&5));
    }

    #[test]
    fn zero_latency_tenant_is_sized_by_rate_and_pending() {
        let plan = plan_pickup(&inputs(&[("A", 0.0, 5.0, 3)]));
        // No latency observation: min(5 * 1.3 jobs, 3 pending) = 3, and the
        // pile-up pass has nothing left to add.
        assert_eq!(plan.get("A"), Some(&3));
    }

    #[test]
    fn unreliable_tenant_gets_a_probe_without_spending_time() {
        // Latency known but no arrival rate: the rate-driven candidate is 0,
        // which is clamped up to a probe of 1 that leaves the time budget for
        // the pile-up pass.
        let plan = plan_pickup(&inputs(&[("A", 10.0, 0.0, 4)]));
        // Pass 1 probes 1 job; pass 2 has 1.3s left: 1.3 / 10.0 rounds to 0.
        assert_eq!(plan.get("A"), Some(&1));
    }

    #[test]
    fn tenant_without_pending_jobs_is_dropped_from_the_plan() {
        let plan = plan_pickup(&inputs(&[("A", 0.1, 10.0, 0)]));
        assert!(plan.is_empty());
    }

    #[test]
    fn recently_drained_tenant_moves_to_the_back() {
        // Both tenants would fill the whole budget; the recently drained one
        // must be planned last and squeezed by whatever remains.
        let mut inputs = inputs(&[("drained", 0.1, 100.0, 1000), ("healthy", 0.2, 100.0, 1000)]);
        inputs
            .last_drained
            .insert("drained".to_owned(), inputs.now - chrono::Duration::seconds(1));

        let plan = plan_pickup(&inputs);
        // healthy: min(100 * 1.3, 1.3 / 0.2) floors to 6 jobs, 1.2s spent.
        // drained: the leftover 0.1s budget sizes to less than one job, so it
        // only gets the single-probe pick.
        assert_eq!(plan.get("healthy"), Some(&6));
        assert_eq!(plan.get("drained"), Some(&1));
    }

    #[test]
    fn drain_penalty_expires_after_ten_timeouts() {
        let mut inputs = inputs(&[("drained", 0.1, 100.0, 1000), ("healthy", 0.2, 100.0, 1000)]);
        inputs
            .last_drained
            .insert("drained".to_owned(), inputs.now - chrono::Duration::seconds(11));

        let plan = plan_pickup(&inputs);
        // Penalty expired: "drained" is planned first again (it sorts earlier
        // by latency) and takes min(130, 13) = 13 jobs.
        assert_eq!(plan.get("drained"), Some(&13));
    }

    #[test]
    fn exhausted_budget_still_reserves_one_job_per_pending_tenant() {
        let mut inputs = inputs(&[
            ("A", 0.1, 1000.0, 1000),
            ("B", 1.0, 1.0, 5),
            ("C", 1.0, 1.0, 7),
        ]);
        inputs.job_query_batch_size = 13;
        let plan = plan_pickup(&inputs);
        // A swallows the entire batch; B and C keep their survival pick.
        assert_eq!(plan.get("A"), Some(&13));
        assert_eq!(plan.get("B"), Some(&1));
        assert_eq!(plan.get("C"), Some(&1));
    }

    #[test]
    fn tenant_missing_from_the_latency_list_is_ignored() {
        let mut inputs = inputs(&[("A", 0.1, 10.0, 50)]);
        inputs.pending.insert("ghost".to_owned(), 10);
        let plan = plan_pickup(&inputs);
        assert!(!plan.contains_key("ghost"));
    }
}
