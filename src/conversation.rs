//! Conversation state for a messaging front end.
//!
//! A transfer needs two uploads from the same requester, in order: first the
//! style image, then the content image. Each requester gets their own state,
//! keyed by identity, cycling through
//! {awaiting-style -> awaiting-content -> processing -> awaiting-style}.
//! The tracker owns no transport: it only answers "what should the front end
//! do next" for each incoming event.

use std::{collections::HashMap, path::PathBuf};

/// Where one requester currently is in the two-upload exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the style image upload
    AwaitingStyle,
    /// Style image saved, waiting for the content image upload
    AwaitingContent,
    /// Both images collected, the transfer is running
    Processing,
}

/// What the front end should do in response to an event.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Ask the requester for their style image
    PromptForStyle,
    /// Acknowledge the style image and ask for the content image
    PromptForContent,
    /// Both paths are collected: run the transfer, then call
    /// [`ConversationTracker::completed`]
    RunTransfer { style: PathBuf, content: PathBuf },
    /// An upload arrived while a transfer is already running for this
    /// requester; ask them to wait
    Busy,
}

struct Conversation {
    phase: Phase,
    style: Option<PathBuf>,
}

/// Tracks every requester's conversation. One instance per front end.
#[derive(Default)]
pub struct ConversationTracker {
    states: HashMap<String, Conversation>,
}

impl ConversationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The requester's current phase; unknown requesters are awaiting style.
    pub fn phase(&self, requester: &str) -> Phase {
        self.states
            .get(requester)
            .map_or(Phase::AwaitingStyle, |c| c.phase)
    }

    /// A `/start`-style command: resets the requester's exchange.
    pub fn begin(&mut self, requester: &str) -> Reply {
        self.states.insert(
            requester.to_owned(),
            Conversation {
                phase: Phase::AwaitingStyle,
                style: None,
            },
        );
        Reply::PromptForStyle
    }

    /// An image upload arrived for the requester, saved at `path`.
    pub fn image_received(&mut self, requester: &str, path: PathBuf) -> Reply {
        let conversation = self
            .states
            .entry(requester.to_owned())
            .or_insert(Conversation {
                phase: Phase::AwaitingStyle,
                style: None,
            });

        match conversation.phase {
            Phase::AwaitingStyle => {
                conversation.style = Some(path);
                conversation.phase = Phase::AwaitingContent;
                Reply::PromptForContent
            }
            Phase::AwaitingContent => match conversation.style.take() {
                Some(style) => {
                    conversation.phase = Phase::Processing;
                    Reply::RunTransfer {
                        style,
                        content: path,
                    }
                }
                // style path was lost (shouldn't happen): start over
                None => {
                    conversation.style = Some(path);
                    Reply::PromptForContent
                }
            },
            Phase::Processing => Reply::Busy,
        }
    }

    /// The transfer for this requester finished (or failed); they can start
    /// a new exchange.
    pub fn completed(&mut self, requester: &str) {
        if let Some(conversation) = self.states.get_mut(requester) {
            conversation.phase = Phase::AwaitingStyle;
            conversation.style = None;
        }
    }
}
