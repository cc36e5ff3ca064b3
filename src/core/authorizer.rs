//! Maps a caller's mTLS identity to the set of commands it may start
//! (spec §4.5).
//!
//! The table is a built-in map loaded once at process start: `root` may run
//! anything, `valid_client` may run `echo`, `cat`, or `ls`. This mirrors the
//! sample table the original implementation shipped; only `Start` is gated,
//! since Stop/Status/Tail treat a job id as a capability once a caller has
//! learned it.

use std::collections::{HashMap, HashSet};

const WILDCARD: &str = "*";

pub struct Authorizer {
    table: HashMap<String, HashSet<String>>,
}

impl Authorizer {
    /// The table this system ships with today.
    pub fn with_default_table() -> Self {
        let mut table = HashMap::new();
        table.insert("root".to_string(), HashSet::from([WILDCARD.to_string()]));
        table.insert(
            "valid_client".to_string(),
            HashSet::from(["echo".to_string(), "cat".to_string(), "ls".to_string()]),
        );
        Authorizer { table }
    }

    #[cfg(test)]
    pub fn with_table(table: HashMap<String, HashSet<String>>) -> Self {
        Authorizer { table }
    }

    /// `true` iff `identity` may start `command_name`.
    pub fn authorize_start(&self, identity: &str, command_name: &str) -> bool {
        match self.table.get(identity) {
            None => false,
            Some(commands) if commands.len() == 1 && commands.contains(WILDCARD) => true,
            Some(commands) => commands.contains(command_name),
        }
    }
}

impl Default for Authorizer {
    fn default() -> Self {
        Self::with_default_table()
    }
}
