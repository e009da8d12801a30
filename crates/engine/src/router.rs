//! Task router — resolves aliases and presets to a loaded model ID.
//!
//! The router is a pure function of its inputs: the requested name, the
//! set of loaded models, and an optional load snapshot from the
//! concurrency controller. It mutates nothing; the caller surfaces a 404
//! when the returned ID turns out not to be loaded.

use std::collections::HashMap;

use lmx_domain::config::RoutingConfig;

/// The special alias meaning "any loaded model, least loaded first".
pub const AUTO_ALIAS: &str = "auto";

#[derive(Debug, Clone, Default)]
pub struct TaskRouter {
    aliases: HashMap<String, Vec<String>>,
    default_model: Option<String>,
}

impl TaskRouter {
    pub fn new(aliases: HashMap<String, Vec<String>>, default_model: Option<String>) -> Self {
        Self {
            aliases,
            default_model,
        }
    }

    pub fn from_config(routing: &RoutingConfig) -> Self {
        Self::new(routing.aliases.clone(), routing.default_model.clone())
    }

    pub fn aliases(&self) -> &HashMap<String, Vec<String>> {
        &self.aliases
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    /// Resolve a requested name to a model ID.
    ///
    /// Order: exact loaded ID → `auto` → configured alias preference list
    /// → default model (if loaded) → the requested name unchanged.
    pub fn resolve(
        &self,
        requested: &str,
        loaded_ids: &[String],
        load_snapshot: Option<&HashMap<String, f64>>,
    ) -> String {
        if loaded_ids.iter().any(|id| id == requested) {
            return requested.to_string();
        }

        if requested == AUTO_ALIAS {
            if let Some(best) = least_loaded(loaded_ids, load_snapshot) {
                return best;
            }
            return requested.to_string();
        }

        if let Some(preferences) = self.aliases.get(requested) {
            let candidates: Vec<String> = preferences
                .iter()
                .filter(|p| loaded_ids.iter().any(|id| id == *p))
                .cloned()
                .collect();
            match candidates.len() {
                0 => {}
                1 => return candidates.into_iter().next().unwrap(),
                _ => {
                    if let Some(best) = least_loaded(&candidates, load_snapshot) {
                        return best;
                    }
                }
            }
        }

        if let Some(default) = &self.default_model {
            if loaded_ids.iter().any(|id| id == default) {
                return default.clone();
            }
        }

        requested.to_string()
    }
}

/// Lowest load score wins; ties keep list order. With no snapshot, the
/// first candidate wins.
fn least_loaded(
    candidates: &[String],
    load_snapshot: Option<&HashMap<String, f64>>,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }
    let Some(snapshot) = load_snapshot else {
        return Some(candidates[0].clone());
    };
    let mut best = &candidates[0];
    let mut best_score = snapshot.get(best).copied().unwrap_or(0.0);
    for candidate in &candidates[1..] {
        let score = snapshot.get(candidate).copied().unwrap_or(0.0);
        if score < best_score {
            best = candidate;
            best_score = score;
        }
    }
    Some(best.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn router() -> TaskRouter {
        let mut aliases = HashMap::new();
        aliases.insert(
            "fast".to_string(),
            vec!["small-a".to_string(), "small-b".to_string()],
        );
        TaskRouter::new(aliases, Some("main".to_string()))
    }

    #[test]
    fn exact_loaded_id_wins() {
        let resolved = router().resolve("small-b", &loaded(&["small-a", "small-b"]), None);
        assert_eq!(resolved, "small-b");
    }

    #[test]
    fn auto_picks_least_loaded() {
        let mut snapshot = HashMap::new();
        snapshot.insert("busy".to_string(), 5.0);
        snapshot.insert("idle".to_string(), 0.5);
        let resolved = router().resolve("auto", &loaded(&["busy", "idle"]), Some(&snapshot));
        assert_eq!(resolved, "idle");
    }

    #[test]
    fn auto_with_nothing_loaded_falls_through() {
        // Caller surfaces the 404.
        assert_eq!(router().resolve("auto", &[], None), "auto");
    }

    #[test]
    fn alias_takes_first_loaded_preference() {
        let resolved = router().resolve("fast", &loaded(&["small-b", "main"]), None);
        assert_eq!(resolved, "small-b");
    }

    #[test]
    fn alias_tie_broken_by_load() {
        let mut snapshot = HashMap::new();
        snapshot.insert("small-a".to_string(), 3.0);
        snapshot.insert("small-b".to_string(), 1.0);
        let resolved = router().resolve(
            "fast",
            &loaded(&["small-a", "small-b"]),
            Some(&snapshot),
        );
        assert_eq!(resolved, "small-b");
    }

    #[test]
    fn unknown_name_falls_back_to_default() {
        let resolved = router().resolve("mystery", &loaded(&["main"]), None);
        assert_eq!(resolved, "main");
    }

    #[test]
    fn unknown_name_without_default_passes_through() {
        let resolved =
            TaskRouter::new(HashMap::new(), None).resolve("mystery", &loaded(&["m"]), None);
        assert_eq!(resolved, "mystery");
    }

    #[test]
    fn resolve_is_pure() {
        let r = router();
        let ids = loaded(&["small-a"]);
        assert_eq!(r.resolve("fast", &ids, None), r.resolve("fast", &ids, None));
    }
}
