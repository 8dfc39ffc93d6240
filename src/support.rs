//! Support chat with an AI assistant and admin takeover

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::auth::AdminCapability;
use crate::completion::TextCompletion;
use crate::config::AppConfig;
use crate::error::Error;
use crate::models::{ChatMessage, ChatSender, ChatThread};
use crate::store::{
    collections, server_timestamp, to_document, DocRef, LedgerStore, Mutation, Query, SortOrder,
    Subscription,
};
use crate::validation;

fn thread_ref(user_id: &str) -> DocRef {
    DocRef::new(collections::SUPPORT_CHATS, user_id)
}

fn speaker(sender: ChatSender) -> &'static str {
    match sender {
        ChatSender::User => "User",
        ChatSender::Assistant => "Assistant",
        ChatSender::Admin => "Administrator",
    }
}

pub struct SupportChat {
    store: Arc<dyn LedgerStore>,
    completion: Arc<dyn TextCompletion>,
    config: Arc<AppConfig>,
}

impl SupportChat {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        completion: Arc<dyn TextCompletion>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            completion,
            config,
        }
    }

    /// Read-modify-write of one thread; returns the thread as committed
    async fn modify<F>(&self, user_id: &str, change: F) -> Result<ChatThread, Error>
    where
        F: Fn(&mut ChatThread) + Send + Sync,
    {
        let target = thread_ref(user_id);
        let commit = self
            .store
            .run_transaction(std::slice::from_ref(&target), &|txn| {
                let mut thread = txn
                    .decode::<ChatThread>(&target)?
                    .unwrap_or_else(|| ChatThread::new(user_id));
                change(&mut thread);
                thread.updated_at = None;

                let mut fields = to_document(&thread)?;
                fields.insert("updatedAt".to_string(), server_timestamp());
                Ok(vec![Mutation::Set {
                    target: target.clone(),
                    fields,
                }])
            })
            .await?;

        let mut thread = commit
            .reads
            .decode::<ChatThread>(&target)?
            .unwrap_or_else(|| ChatThread::new(user_id));
        change(&mut thread);
        thread.updated_at = Some(commit.commit_time);
        Ok(thread)
    }

    fn prompt(&self, thread: &ChatThread) -> String {
        let skip = thread
            .messages
            .len()
            .saturating_sub(self.config.chat_context_messages);
        let mut prompt = self.config.assistant_instructions.clone();
        prompt.push_str("\n\n");
        for message in thread.messages.iter().skip(skip) {
            prompt.push_str(speaker(message.sender));
            prompt.push_str(": ");
            prompt.push_str(&message.text);
            prompt.push('\n');
        }
        prompt.push_str("Assistant:");
        prompt
    }

    /// Post a user message and, unless an admin has taken over, the
    /// assistant's reply.
    ///
    /// Returns the reply, or `None` while an admin handles the thread. A
    /// completion failure is returned as is; the user message stays posted.
    pub async fn send(&self, user_id: &str, text: &str) -> Result<Option<ChatMessage>, Error> {
        validation::require_text("message", text)?;

        let message = ChatMessage {
            sender: ChatSender::User,
            text: text.trim().to_string(),
            sent_at: Utc::now(),
        };
        let thread = self
            .modify(user_id, |thread| thread.messages.push(message.clone()))
            .await?;

        if thread.admin_takeover {
            debug!("Thread of {} is handled by an admin, assistant stays silent", user_id);
            return Ok(None);
        }

        let reply_text = self.completion.generate(&self.prompt(&thread)).await?;
        let reply = ChatMessage {
            sender: ChatSender::Assistant,
            text: reply_text,
            sent_at: Utc::now(),
        };
        self.modify(user_id, |thread| thread.messages.push(reply.clone()))
            .await?;
        Ok(Some(reply))
    }

    /// Silence or re-enable the assistant on one thread
    pub async fn set_takeover(
        &self,
        admin: &AdminCapability,
        user_id: &str,
        enabled: bool,
    ) -> Result<ChatThread, Error> {
        let thread = self
            .modify(user_id, |thread| thread.admin_takeover = enabled)
            .await?;
        info!(
            "{} set takeover of {}'s support thread to {}",
            admin.admin_id(),
            user_id,
            enabled
        );
        Ok(thread)
    }

    /// Answer as an administrator. Also takes the thread over.
    pub async fn admin_reply(
        &self,
        admin: &AdminCapability,
        user_id: &str,
        text: &str,
    ) -> Result<ChatMessage, Error> {
        validation::require_text("message", text)?;

        let message = ChatMessage {
            sender: ChatSender::Admin,
            text: text.trim().to_string(),
            sent_at: Utc::now(),
        };
        self.modify(user_id, |thread| {
            thread.admin_takeover = true;
            thread.messages.push(message.clone());
        })
        .await?;
        info!("{} replied in {}'s support thread", admin.admin_id(), user_id);
        Ok(message)
    }

    /// The thread of one user; empty if they never wrote
    pub async fn thread(&self, user_id: &str) -> Result<ChatThread, Error> {
        Ok(self
            .store
            .get_record(&thread_ref(user_id))
            .await?
            .map(|record| record.decode())
            .transpose()?
            .unwrap_or_else(|| ChatThread::new(user_id)))
    }

    /// Live view of one thread
    pub async fn watch_thread(&self, user_id: &str) -> Result<Subscription, Error> {
        self.store
            .subscribe(Query::new(collections::SUPPORT_CHATS).eq("id", user_id))
            .await
    }

    /// Every thread, most recently active first
    pub async fn threads(&self, _admin: &AdminCapability) -> Result<Vec<ChatThread>, Error> {
        let query =
            Query::new(collections::SUPPORT_CHATS).order("updatedAt", SortOrder::Descending);
        self.store.query(&query).await?.decode()
    }
}
