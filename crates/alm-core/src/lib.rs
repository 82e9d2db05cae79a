use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod event_ipc;
pub mod reconnect;
pub mod terminal_ipc;

pub const DEFAULT_TASKS_FILE: &str = "tasks.json";
pub const DEFAULT_PROGRESS_FILE: &str = "progress.txt";

pub const TOPIC_TICKETS: &str = "tickets";
pub const TOPIC_PROGRESS: &str = "progress";
pub const TOPIC_SYSTEM: &str = "system";
pub const TOPIC_ERROR: &str = "error";
pub const PROCESS_TOPIC_PREFIX: &str = "process:";

/// One of the two collaborator files a project directory exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchedFile {
    Tasks,
    Progress,
}

impl WatchedFile {
    pub const ALL: [WatchedFile; 2] = [WatchedFile::Tasks, WatchedFile::Progress];

    pub fn topic(&self) -> &'static str {
        match self {
            WatchedFile::Tasks => TOPIC_TICKETS,
            WatchedFile::Progress => TOPIC_PROGRESS,
        }
    }
}

impl fmt::Display for WatchedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// File names (relative to the project directory) of the task list and progress log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorFiles {
    pub tasks: String,
    pub progress: String,
}

impl Default for CollaboratorFiles {
    fn default() -> Self {
        Self {
            tasks: DEFAULT_TASKS_FILE.to_string(),
            progress: DEFAULT_PROGRESS_FILE.to_string(),
        }
    }
}

impl CollaboratorFiles {
    pub fn classify(&self, file_name: &str) -> Option<WatchedFile> {
        if file_name == self.tasks {
            Some(WatchedFile::Tasks)
        } else if file_name == self.progress {
            Some(WatchedFile::Progress)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Tickets,
    Progress,
    Process(String),
}

impl Topic {
    pub fn process(id: impl Into<String>) -> Self {
        Topic::Process(id.into())
    }

    pub fn watched_file(&self) -> Option<WatchedFile> {
        match self {
            Topic::Tickets => Some(WatchedFile::Tasks),
            Topic::Progress => Some(WatchedFile::Progress),
            Topic::Process(_) => None,
        }
    }

    pub fn process_id(&self) -> Option<&str> {
        match self {
            Topic::Process(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Tickets => f.write_str(TOPIC_TICKETS),
            Topic::Progress => f.write_str(TOPIC_PROGRESS),
            Topic::Process(id) => write!(f, "{PROCESS_TOPIC_PREFIX}{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        match trimmed {
            TOPIC_TICKETS => Ok(Topic::Tickets),
            TOPIC_PROGRESS => Ok(Topic::Progress),
            other => match other.strip_prefix(PROCESS_TOPIC_PREFIX) {
                Some(id) if !id.trim().is_empty() => Ok(Topic::Process(id.trim().to_string())),
                Some(_) => Err("missing process id".to_string()),
                None => Err(format!("unknown topic: {other}")),
            },
        }
    }
}

/// Result of parsing a comma separated topic list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSelection {
    pub accepted: Vec<Topic>,
    pub rejected: Vec<(String, String)>,
}

impl TopicSelection {
    pub fn names(&self) -> Vec<String> {
        self.accepted.iter().map(ToString::to_string).collect()
    }
}

/// Parses `tickets,progress,process:<id>`. Duplicates collapse onto the first occurrence and
/// an empty list selects both file topics.
pub fn parse_topic_list(raw: &str) -> TopicSelection {
    let mut selection = TopicSelection::default();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<Topic>() {
            Ok(topic) => {
                if !selection.accepted.contains(&topic) {
                    selection.accepted.push(topic);
                }
            }
            Err(reason) => selection.rejected.push((token.to_string(), reason)),
        }
    }
    if selection.accepted.is_empty() && selection.rejected.is_empty() {
        selection.accepted = vec![Topic::Tickets, Topic::Progress];
    }
    selection
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_list_keeps_order_and_collapses_duplicates() {
        let selection = parse_topic_list(" tickets, process:abc ,tickets,process:abc,progress");
        assert_eq!(
            selection.accepted,
            vec![Topic::Tickets, Topic::process("abc"), Topic::Progress]
        );
        assert!(selection.rejected.is_empty());
        assert_eq!(
            selection.names(),
            vec!["tickets", "process:abc", "progress"]
        );
    }

    #[test]
    fn topic_list_rejects_unknown_and_empty_process_ids() {
        let selection = parse_topic_list("tickets,bogus,process:");
        assert_eq!(selection.accepted, vec![Topic::Tickets]);
        let rejected: Vec<_> = selection.rejected.iter().map(|(raw, _)| raw.as_str()).collect();
        assert_eq!(rejected, vec!["bogus", "process:"]);
    }

    #[test]
    fn empty_topic_list_selects_file_topics() {
        let selection = parse_topic_list(" , ");
        assert_eq!(selection.accepted, vec![Topic::Tickets, Topic::Progress]);
    }

    #[test]
    fn process_ids_may_contain_colons() {
        let topic: Topic = "process:run:42".parse().expect("topic");
        assert_eq!(topic.process_id(), Some("run:42"));
        assert_eq!(topic.to_string(), "process:run:42");
    }

    #[test]
    fn collaborator_files_classify_by_name() {
        let files = CollaboratorFiles::default();
        assert_eq!(files.classify("tasks.json"), Some(WatchedFile::Tasks));
        assert_eq!(files.classify("progress.txt"), Some(WatchedFile::Progress));
        assert_eq!(files.classify("tasks.json.swp"), None);
        assert_eq!(WatchedFile::Tasks.topic(), "tickets");
    }
}
