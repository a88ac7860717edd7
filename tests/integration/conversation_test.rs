//! Conversation Integration Tests
//!
//! Compaction accounting, fork containment and the revert/restore law.

use std::sync::Arc;

use forgeflow_core::ScriptedAgentStream;
use forgeflow_desktop::models::conversation::{ConversationMessage, MessageRole};
use forgeflow_desktop::models::settings::EngineConfig;
use forgeflow_desktop::services::conversation::{ConversationEngine, FnSummarizer};
use forgeflow_desktop::storage::Database;
use forgeflow_desktop::{AppError, SessionStore};
use proptest::prelude::*;

const SUMMARY: &str = "Earlier turns settled on SQLite with a pooled connection.";

fn engine() -> ConversationEngine {
    let summarizer = FnSummarizer::new(|_| Box::pin(async { Ok(SUMMARY.to_string()) }));
    ConversationEngine::new(
        Arc::new(Database::new_in_memory().unwrap()),
        Arc::new(ScriptedAgentStream::new()),
        Arc::new(summarizer),
        Arc::new(SessionStore::new()),
        EngineConfig::default(),
    )
}

/// A conversation of `count` messages, each estimated at `tokens` tokens.
async fn conversation_with(
    engine: &ConversationEngine,
    count: usize,
    tokens: usize,
) -> (i64, Vec<ConversationMessage>) {
    let conversation = engine.create_conversation(1, "Storage design").unwrap();
    let mut messages = Vec::with_capacity(count);
    for i in 0..count {
        let role = if i % 2 == 0 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        // Four characters per token; the digit keeps contents distinct.
        let content = format!("{}{}", i % 10, "x".repeat(tokens * 4 - 1));
        messages.push(
            engine
                .append_message(conversation.id, role, &content, None)
                .await
                .unwrap(),
        );
    }
    (conversation.id, messages)
}

fn fingerprint(messages: &[ConversationMessage]) -> Vec<(i64, MessageRole, String)> {
    messages
        .iter()
        .map(|m| (m.id, m.role, m.content.clone()))
        .collect()
}

// ============================================================================
// Compaction
// ============================================================================

#[tokio::test]
async fn test_compaction_conserves_tokens() {
    let engine = engine();
    let (id, messages) = conversation_with(&engine, 10, 100).await;
    assert_eq!(engine.get_token_estimate_total(id).unwrap(), 1000);

    let report = engine.compact(id, 0.5).await.unwrap();
    let summary_tokens = report.summary.token_estimate;
    assert_eq!(summary_tokens, (SUMMARY.chars().count() as i64 + 3) / 4);

    let compacted: Vec<i64> = messages[..5].iter().map(|m| m.id).collect();
    assert_eq!(report.compacted_message_ids, compacted);
    assert_eq!(report.tokens_before, 1000);
    assert_eq!(report.tokens_after, 500 + summary_tokens);
    assert_eq!(engine.get_token_estimate_total(id).unwrap(), 500 + summary_tokens);

    let active = engine.active_messages(id).unwrap();
    assert_eq!(active.len(), 6);
    assert!(active[0].is_compaction_summary);
    assert_eq!(
        active[1..].iter().map(|m| m.id).collect::<Vec<_>>(),
        messages[5..].iter().map(|m| m.id).collect::<Vec<_>>()
    );

    let all = engine.all_messages(id).unwrap();
    let deleted: Vec<&ConversationMessage> = all.iter().filter(|m| m.is_deleted).collect();
    assert_eq!(deleted.len(), 5);
    assert!(deleted
        .iter()
        .all(|m| m.compacted_into == Some(report.summary.id)));
    assert!(engine.get_conversation(id).unwrap().compacted_at.is_some());
}

#[tokio::test]
async fn test_append_after_compaction_lands_at_end() {
    let engine = engine();
    let (id, _) = conversation_with(&engine, 4, 10).await;
    engine.compact(id, 0.5).await.unwrap();

    let appended = engine
        .append_message(id, MessageRole::User, "next question", None)
        .await
        .unwrap();
    let active = engine.active_messages(id).unwrap();
    assert_eq!(active.last().unwrap().id, appended.id);
}

// ============================================================================
// Fork & export
// ============================================================================

#[tokio::test]
async fn test_fork_contains_exactly_the_prefix() {
    let engine = engine();
    let (source, messages) = conversation_with(&engine, 6, 5).await;
    let before = fingerprint(&engine.active_messages(source).unwrap());

    let fork = engine
        .fork(source, Some(messages[3].id), false)
        .await
        .unwrap();
    let forked = engine.active_messages(fork.conversation.id).unwrap();

    let expected: Vec<(MessageRole, String)> = messages[..4]
        .iter()
        .map(|m| (m.role, m.content.clone()))
        .collect();
    let actual: Vec<(MessageRole, String)> = forked
        .iter()
        .map(|m| (m.role, m.content.clone()))
        .collect();
    assert_eq!(actual, expected);

    assert_eq!(fingerprint(&engine.active_messages(source).unwrap()), before);
    assert_eq!(engine.list_children(source).unwrap()[0].conversation.id, fork.conversation.id);
}

#[tokio::test]
async fn test_fork_skips_reverted_messages() {
    let engine = engine();
    let (source, messages) = conversation_with(&engine, 5, 5).await;
    engine.revert(source, messages[1].id).await.unwrap();

    let fork = engine.fork(source, None, false).await.unwrap();
    assert_eq!(fork.messages.len(), 2);

    let err = engine
        .fork(source, Some(messages[3].id), false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_export_selected_messages() {
    let engine = engine();
    let (source, messages) = conversation_with(&engine, 4, 5).await;

    let (exported, copies) = engine
        .export_to_new_chat(source, &[messages[2].id, messages[1].id], 7)
        .await
        .unwrap();
    assert_eq!(exported.project_id, 7);
    assert_eq!(exported.title, "Export from Storage design");
    assert_eq!(copies.len(), 2);
    assert_eq!(copies[0].content, messages[1].content);
    assert_eq!(copies[1].content, messages[2].content);
}

// ============================================================================
// Revert / restore
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_revert_then_restore_reproduces_active_set(
        (count, anchor) in (1usize..12).prop_flat_map(|n| (Just(n), 0..n)),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let engine = engine();
            let (id, messages) = conversation_with(&engine, count, 3).await;
            let original = fingerprint(&engine.active_messages(id).unwrap());
            let total = engine.get_token_estimate_total(id).unwrap();

            let preview = engine.preview_revert(id, messages[anchor].id).unwrap();
            let reverted = engine.revert(id, messages[anchor].id).await.unwrap();
            assert_eq!(reverted.len(), preview);
            assert_eq!(reverted.len(), count - anchor - 1);
            assert_eq!(engine.active_messages(id).unwrap().len(), anchor + 1);

            for message_id in reverted.iter().rev() {
                engine.restore_message(*message_id).await.unwrap();
            }

            assert_eq!(fingerprint(&engine.active_messages(id).unwrap()), original);
            assert_eq!(engine.get_token_estimate_total(id).unwrap(), total);
        });
    }
}
