use crate::types::Conversation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Handover,
}

/// Decides whether an inbound message should start a hand-over to a human.
///
/// Implementations must be pure: the controller applies the transition.
/// Whether the bot answers at all is the controller's call, based on
/// `conversation.bot_enabled`; a policy only says whether to start a
/// hand-over.
pub trait HandoffPolicy: Send + Sync {
    fn decide(&self, text: &str, conversation: &Conversation) -> Decision;
}

/// Case-insensitive substring match against a list of trigger tokens.
#[derive(Debug, Clone)]
pub struct KeywordHandoff {
    triggers: Vec<String>,
}

impl KeywordHandoff {
    pub fn new<I, S>(triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let triggers = triggers
            .into_iter()
            .map(|t| t.as_ref().trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { triggers }
    }
}

impl Default for KeywordHandoff {
    fn default() -> Self {
        Self::new(["AGENTE"])
    }
}

impl HandoffPolicy for KeywordHandoff {
    fn decide(&self, text: &str, _conversation: &Conversation) -> Decision {
        let upper = text.to_uppercase();
        if self.triggers.iter().any(|t| upper.contains(t.as_str())) {
            Decision::Handover
        } else {
            Decision::Continue
        }
    }
}
