use clap::Arg;

use super::{ConfigError, Flags, OptionSet, ParsedFlags, bool_flag};

const LEADER_ELECTION: &str = "leader-election";
const LEADER_ELECTION_ID: &str = "leader-election-id";
const LEADER_ELECTION_NAMESPACE: &str = "leader-election-namespace";

/// Returns the name of the leader election lease used by the extension with the given name.
pub fn leader_election_name_id(extension_name: &str) -> String {
    format!("{extension_name}-leader-election")
}

/// Options of the [`Manager`][crate::manager::Manager].
#[derive(Debug)]
pub struct ManagerOptions {
    pub leader_election: bool,
    pub leader_election_id: String,

    /// Usually read from the `LEADER_ELECTION_NAMESPACE` environment variable.
    pub leader_election_namespace: Option<String>,
}

impl ManagerOptions {
    pub fn new(extension_name: &str) -> Self {
        Self {
            leader_election: true,
            leader_election_id: leader_election_name_id(extension_name),
            leader_election_namespace: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionSettings {
    pub id: String,

    /// The namespace of the lease. Falls back to the default namespace of the client config.
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedManagerOptions {
    pub leader_election: Option<LeaderElectionSettings>,
}

impl OptionSet for ManagerOptions {
    type Completed = CompletedManagerOptions;

    fn add_flags(&self, flags: &mut Flags) {
        flags.add(bool_flag(
            LEADER_ELECTION,
            self.leader_election,
            "Whether to use leader election or not when running this controller manager",
        ));

        flags.add(
            Arg::new(LEADER_ELECTION_ID)
                .long(LEADER_ELECTION_ID)
                .help("The name of the lease used for leader election")
                .default_value(self.leader_election_id.clone()),
        );

        let namespace = Arg::new(LEADER_ELECTION_NAMESPACE)
            .long(LEADER_ELECTION_NAMESPACE)
            .env("LEADER_ELECTION_NAMESPACE")
            .help("The namespace of the lease used for leader election");
        flags.add(match &self.leader_election_namespace {
            Some(namespace_default) => namespace.default_value(namespace_default.clone()),
            None => namespace,
        });
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        let enabled = flags
            .get_one(LEADER_ELECTION)?
            .unwrap_or(self.leader_election);

        if !enabled {
            return Ok(CompletedManagerOptions {
                leader_election: None,
            });
        }

        let id = flags
            .get_one::<String>(LEADER_ELECTION_ID)?
            .unwrap_or_else(|| self.leader_election_id.clone());
        let namespace = flags
            .get_one::<String>(LEADER_ELECTION_NAMESPACE)?
            .filter(|namespace| !namespace.is_empty());

        Ok(CompletedManagerOptions {
            leader_election: Some(LeaderElectionSettings { id, namespace }),
        })
    }
}
