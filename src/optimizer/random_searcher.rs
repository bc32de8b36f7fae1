//! Random search

use super::search_space::{Configuration, SearchSpace};
use super::searcher::{SearchContext, Searcher, SearcherConfig, SearcherCore, SearcherState};
use crate::error::Result;

/// Samples configurations uniformly (log-uniformly for log dimensions).
///
/// The first proposal is the space's default configuration when
/// `first_is_default` is set, giving a baseline before exploration.
#[derive(Debug)]
pub struct RandomSearcher {
    core: SearcherCore,
}

impl RandomSearcher {
    pub const NAME: &'static str = "random";

    pub fn new(space: SearchSpace, config: SearcherConfig) -> Self {
        Self {
            core: SearcherCore::new(space, config),
        }
    }
}

impl Searcher for RandomSearcher {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn core(&self) -> &SearcherCore {
        &self.core
    }

    fn get_config(&self, _context: &SearchContext) -> Result<Configuration> {
        let candidate = self.core.initial_candidate();
        self.core.propose_novel(candidate, || self.core.sample())
    }

    fn get_state(&self) -> Result<SearcherState> {
        Ok(self.core.state(Self::NAME, serde_json::Value::Null))
    }

    fn clone_from_state(&self, state: SearcherState) -> Result<Box<dyn Searcher>> {
        let core = self.core.from_state(Self::NAME, &state)?;
        Ok(Box::new(Self { core }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KolosalError;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .float("lr", 0.001, 0.1)
            .categorical("act", vec!["relu", "tanh"])
    }

    #[test]
    fn test_first_config_is_default() {
        let searcher = RandomSearcher::new(space(), SearcherConfig::default());
        let first = searcher.get_config(&SearchContext::default()).unwrap();
        assert_eq!(first, space().default_configuration());
        assert_eq!(searcher.get_reward(&first), Some(f64::NEG_INFINITY));

        let second = searcher.get_config(&SearchContext::default()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_first_is_default_disabled() {
        let config = SearcherConfig::default().with_first_is_default(false);
        let searcher = RandomSearcher::new(space(), config);
        let first = searcher.get_config(&SearchContext::default()).unwrap();
        assert_ne!(first, space().default_configuration());
    }

    #[test]
    fn test_exhausts_small_discrete_space() {
        let space = SearchSpace::new().boolean("flag");
        let searcher = RandomSearcher::new(space, SearcherConfig::default());
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(searcher.get_config(&SearchContext::default()).unwrap());
        }
        assert_ne!(seen[0], seen[1]);

        let err = searcher.get_config(&SearchContext::default()).unwrap_err();
        assert!(matches!(err, KolosalError::SearchSpaceExhausted { retries: 100 }));
    }

    #[test]
    fn test_same_seed_same_proposals() {
        let a = RandomSearcher::new(space(), SearcherConfig::default().with_seed(7));
        let b = RandomSearcher::new(space(), SearcherConfig::default().with_seed(7));
        for _ in 0..5 {
            let ctx = SearchContext::default();
            assert_eq!(a.get_config(&ctx).unwrap(), b.get_config(&ctx).unwrap());
        }
    }

    #[test]
    fn test_state_restores_proposal_sequence() {
        let searcher = RandomSearcher::new(space(), SearcherConfig::default());
        let ctx = SearchContext::default();
        let c = searcher.get_config(&ctx).unwrap();
        searcher.update_reward(&c, 0.4, None).unwrap();

        let restored = searcher.clone_from_state(searcher.get_state().unwrap()).unwrap();
        assert_eq!(restored.get_best_config_reward(), searcher.get_best_config_reward());
        for _ in 0..3 {
            assert_eq!(searcher.get_config(&ctx).unwrap(), restored.get_config(&ctx).unwrap());
        }
    }

    #[test]
    fn test_wrong_state_kind_rejected() {
        let searcher = RandomSearcher::new(space(), SearcherConfig::default());
        let mut state = searcher.get_state().unwrap();
        state.searcher = "tpe".to_string();
        assert!(searcher.clone_from_state(state).is_err());
    }
}
