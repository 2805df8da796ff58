/// Peer discovery: search-as-you-type over the identity directory
use crate::messenger_types::{Identity, UserId};

/// One directory lookup to run, tagged so late answers can be told apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTicket {
    pub query: String,
    pub generation: u64,
}

/// Search box state: what was typed and what the directory answered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSearch {
    /// Text as typed
    pub query: String,
    /// Latest results, never containing the searcher
    pub results: Vec<Identity>,
    generation: u64,
}

impl PeerSearch {
    /// Record new query text. A blank query clears the results right away
    /// and needs no lookup.
    pub fn update(&mut self, text: &str) -> Option<SearchTicket> {
        self.query = text.to_string();
        self.generation += 1;
        match normalize_query(text) {
            Some(query) => Some(SearchTicket {
                query: query.to_string(),
                generation: self.generation,
            }),
            None => {
                self.results.clear();
                None
            }
        }
    }

    /// Store lookup results unless a newer query superseded them
    pub fn apply(&mut self, ticket: &SearchTicket, results: Vec<Identity>, me: UserId) -> bool {
        if ticket.generation != self.generation {
            return false;
        }
        self.results = exclude_self(results, me);
        true
    }

    /// Empty the search box; in-flight lookups become stale
    pub fn clear(&mut self) {
        self.query.clear();
        self.results.clear();
        self.generation += 1;
    }

    /// Generation of the latest query
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub fn normalize_query(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub fn exclude_self(results: Vec<Identity>, me: UserId) -> Vec<Identity> {
    results.into_iter().filter(|u| u.id != me).collect()
}
