use crate::replica::local_state::Term;
use crate::replica::peers::PeerId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Follower { leader: Option<PeerId> },
    Candidate { term: Term },
    Leader { term: Term },
}

/// ElectionState is this node's view of who leads the cluster. Elections are only started
/// explicitly (see `Replica::campaign`), there are no follower timeouts.
#[derive(Debug)]
pub(crate) struct ElectionState {
    logger: slog::Logger,
    role: Role,
}

impl ElectionState {
    pub(crate) fn new_follower(logger: slog::Logger) -> Self {
        ElectionState {
            logger,
            role: Role::Follower { leader: None },
        }
    }

    pub(crate) fn role(&self) -> &Role {
        &self.role
    }

    pub(crate) fn transition_to_follower(&mut self, leader: Option<PeerId>) {
        if !matches!(&self.role, Role::Follower { leader: current } if *current == leader) {
            slog::info!(self.logger, "Transitioning to follower of {:?} from {:?}", leader, self.role);
        }
        self.role = Role::Follower { leader };
    }

    pub(crate) fn transition_to_candidate(&mut self, term: Term) {
        slog::info!(self.logger, "Transitioning to candidate for term {:?} from {:?}", term, self.role);
        self.role = Role::Candidate { term };
    }

    /// Only a candidate of the same term may become leader. Returns whether it did.
    pub(crate) fn transition_to_leader(&mut self, term: Term) -> bool {
        match self.role {
            Role::Candidate { term: candidate_term } if candidate_term == term => {
                slog::info!(self.logger, "Transitioning to leader for term {:?}", term);
                self.role = Role::Leader { term };
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader_id: &PeerId) {
        if let Role::Follower { leader: leader @ None } = &mut self.role {
            *leader = Some(leader_id.clone());
        }
    }

    pub(crate) fn is_leader_for(&self, term: Term) -> bool {
        self.role == Role::Leader { term }
    }

    pub(crate) fn leader_term(&self) -> Option<Term> {
        match self.role {
            Role::Leader { term } => Some(term),
            _ => None,
        }
    }

    pub(crate) fn known_leader(&self) -> Option<PeerId> {
        match &self.role {
            Role::Follower { leader } => leader.clone(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn election_state() -> ElectionState {
        ElectionState::new_follower(slog::Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn leader_needs_candidacy_for_same_term() {
        let mut state = election_state();
        assert!(!state.transition_to_leader(Term::new(2)));

        state.transition_to_candidate(Term::new(2));
        assert!(!state.transition_to_leader(Term::new(3)));
        assert!(state.transition_to_leader(Term::new(2)));
        assert!(state.is_leader_for(Term::new(2)));
        assert_eq!(state.leader_term(), Some(Term::new(2)));

        state.transition_to_follower(None);
        assert!(!state.is_leader_for(Term::new(2)));
    }

    #[test]
    fn follower_learns_leader_once() {
        let mut state = election_state();
        state.set_leader_if_unknown(&PeerId::new("a"));
        state.set_leader_if_unknown(&PeerId::new("b"));
        assert_eq!(state.known_leader(), Some(PeerId::new("a")));

        state.transition_to_follower(Some(PeerId::new("b")));
        assert_eq!(state.known_leader(), Some(PeerId::new("b")));
    }
}
