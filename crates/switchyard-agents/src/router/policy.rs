//! Load-balancing policies

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use switchyard_core::Error;

use super::registry::Registry;

/// How the router picks among the candidates for a category
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Per-category cursor over registration order
    #[default]
    RoundRobin,
    /// Smallest in-flight load
    LeastLoaded,
    /// Lowest average response time; untried experts score best
    PerformanceBased,
}

impl RoutingPolicy {
    /// Choose one of `candidates` (registry indexes in registration order).
    /// Ties always go to the earliest registered. `cursor` is the round-robin
    /// position for the category being routed.
    pub(crate) fn pick(
        self,
        registry: &Registry,
        candidates: &[usize],
        cursor: &mut usize,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            Self::RoundRobin => {
                let idx = candidates[*cursor % candidates.len()];
                *cursor = cursor.wrapping_add(1);
                Some(idx)
            }
            Self::LeastLoaded => candidates
                .iter()
                .copied()
                .min_by_key(|&idx| registry.at(idx).load),
            Self::PerformanceBased => {
                let mut best: Option<(usize, f64)> = None;
                for &idx in candidates {
                    let expert = registry.at(idx);
                    let score = if expert.completed == 0 {
                        0.0
                    } else {
                        expert.avg_response_time
                    };
                    if best.is_none_or(|(_, best_score)| score < best_score) {
                        best = Some((idx, score));
                    }
                }
                best.map(|(idx, _)| idx)
            }
        }
    }
}

impl std::fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastLoaded => write!(f, "least_loaded"),
            Self::PerformanceBased => write!(f, "performance_based"),
        }
    }
}

impl FromStr for RoutingPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_loaded" => Ok(Self::LeastLoaded),
            "performance_based" => Ok(Self::PerformanceBased),
            other => Err(Error::Config(format!("unknown routing policy '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry(ids: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for id in ids {
            registry.upsert(id, vec!["code".to_string()], json!({}));
        }
        registry
    }

    #[test]
    fn test_round_robin_wraps_in_registration_order() {
        let r = registry(&["e1", "e2", "e3"]);
        let candidates = r.candidates("code", None);
        let mut cursor = 0;
        let picks: Vec<&str> = (0..6)
            .map(|_| {
                let idx = RoutingPolicy::RoundRobin
                    .pick(&r, &candidates, &mut cursor)
                    .unwrap();
                r.at(idx).expert_id.as_str()
            })
            .collect();
        assert_eq!(picks, vec!["e1", "e2", "e3", "e1", "e2", "e3"]);
    }

    #[test]
    fn test_least_loaded_prefers_idle_then_registration_order() {
        let mut r = registry(&["e1", "e2", "e3"]);
        r.at_mut(0).load = 2;
        r.at_mut(1).load = 0;
        r.at_mut(2).load = 1;
        let candidates = r.candidates("code", None);
        let mut cursor = 0;

        let first = RoutingPolicy::LeastLoaded
            .pick(&r, &candidates, &mut cursor)
            .unwrap();
        assert_eq!(r.at(first).expert_id, "e2");
        r.at_mut(first).load += 1;

        // Loads are now [2, 1, 1]
        let second = RoutingPolicy::LeastLoaded
            .pick(&r, &candidates, &mut cursor)
            .unwrap();
        assert_eq!(r.at(second).expert_id, "e2");
    }

    #[test]
    fn test_performance_based_tries_new_expert_first() {
        let mut r = registry(&["veteran", "rookie"]);
        r.at_mut(0).completed = 10;
        r.at_mut(0).avg_response_time = 0.2;
        let candidates = r.candidates("code", None);
        let idx = RoutingPolicy::PerformanceBased
            .pick(&r, &candidates, &mut 0)
            .unwrap();
        assert_eq!(r.at(idx).expert_id, "rookie");
    }

    #[test]
    fn test_performance_based_prefers_faster() {
        let mut r = registry(&["slow", "fast"]);
        r.at_mut(0).completed = 3;
        r.at_mut(0).avg_response_time = 2.0;
        r.at_mut(1).completed = 3;
        r.at_mut(1).avg_response_time = 0.5;
        let candidates = r.candidates("code", None);
        let idx = RoutingPolicy::PerformanceBased
            .pick(&r, &candidates, &mut 0)
            .unwrap();
        assert_eq!(r.at(idx).expert_id, "fast");
    }

    #[test]
    fn test_no_candidates() {
        let r = registry(&[]);
        assert!(RoutingPolicy::LeastLoaded.pick(&r, &[], &mut 0).is_none());
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(
            "least-loaded".parse::<RoutingPolicy>().unwrap(),
            RoutingPolicy::LeastLoaded
        );
        assert_eq!(RoutingPolicy::PerformanceBased.to_string(), "performance_based");
        assert!("random".parse::<RoutingPolicy>().is_err());
        let json = serde_json::to_string(&RoutingPolicy::RoundRobin).unwrap();
        assert_eq!(json, "\"round_robin\"");
    }
}
