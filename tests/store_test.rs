use chrono::Utc;

use mentorlink::chat::{
    ChatStatus, FeedbackType, MeetingNote, MentorshipUpdate, MessageMetadata, MessageType,
    Priority, Progress,
};
use mentorlink::error::ChatError;
use mentorlink::principal::{Principal, PrincipalKind};
use mentorlink::store::Store;

fn principal(id: &str, kind: PrincipalKind) -> Principal {
    Principal {
        id: id.to_string(),
        kind,
        role: kind.as_str().to_string(),
        name: format!("{id} name"),
        email: format!("{id}@example.edu"),
    }
}

/// A fresh store with one student (s1), a second student (s2), a TPO staff
/// member (t1), a second TPO (t2) and a company (x1).
async fn seeded_store() -> (Store, [Principal; 5]) {
    let store = Store::in_memory().await.unwrap();
    store.init().await.unwrap();

    let principals = [
        principal("s1", PrincipalKind::Student),
        principal("s2", PrincipalKind::Student),
        principal("t1", PrincipalKind::TpoStaff),
        principal("t2", PrincipalKind::TpoStaff),
        principal("x1", PrincipalKind::Company),
    ];
    for p in &principals {
        store.insert_principal(p).await.unwrap();
    }
    (store, principals)
}

#[tokio::test]
async fn store_creates_the_database_file_and_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("mentorlink.db");

    let store = Store::new(&db_path).await.unwrap();
    store.init().await.unwrap();
    // init is re-runnable on an existing schema.
    store.init().await.unwrap();

    store
        .insert_principal(&principal("s1", PrincipalKind::Student))
        .await
        .unwrap();
    assert!(db_path.exists());
    assert!(store.principal_by_id("s1").await.unwrap().is_some());
}

#[tokio::test]
async fn create_or_get_is_idempotent_and_commutative() {
    let (store, [s1, _, t1, ..]) = seeded_store().await;

    let (chat, created) = store.create_or_get(&s1, &t1.id).await.unwrap();
    assert!(created);
    assert_eq!(chat.student.id, "s1");
    assert_eq!(chat.tpo.id, "t1");
    assert_eq!(chat.status, ChatStatus::Active);
    assert!(chat.last_message.is_none());

    // Other side, same chat.
    let (again, created) = store.create_or_get(&t1, &s1.id).await.unwrap();
    assert!(!created);
    assert_eq!(again.id, chat.id);

    // Repeat from the original side.
    let (again, created) = store.create_or_get(&s1, &t1.id).await.unwrap();
    assert!(!created);
    assert_eq!(again.id, chat.id);
}

#[tokio::test]
async fn invalid_pairs_are_rejected() {
    let (store, [s1, s2, t1, t2, x1]) = seeded_store().await;

    for (requester, counterpart) in [(&s1, &s2), (&t1, &t2), (&x1, &s1), (&s1, &x1), (&x1, &t1)] {
        let err = store.create_or_get(requester, &counterpart.id).await.unwrap_err();
        assert!(
            matches!(err, ChatError::InvalidPair(_)),
            "{} -> {} should be an invalid pair",
            requester.id,
            counterpart.id
        );
    }
}

#[tokio::test]
async fn unknown_counterpart_is_not_found() {
    let (store, [s1, ..]) = seeded_store().await;
    let err = store.create_or_get(&s1, "ghost").await.unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
}

#[tokio::test]
async fn append_validates_content_participants_and_chat() {
    let (store, [s1, s2, t1, ..]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    let err = store
        .append_message(&chat.id, &s1, "   ", MessageType::Text, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidInput(_)));

    let err = store
        .append_message(&chat.id, &s2, "hi", MessageType::Text, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Forbidden(_)));

    let err = store
        .append_message("missing", &s1, "hi", MessageType::Text, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
}

#[tokio::test]
async fn append_seeds_read_receipts_and_bumps_the_chat() {
    let (store, [s1, _, t1, ..]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    let message = store
        .append_message(&chat.id, &s1, "Hello", MessageType::Text, None, None)
        .await
        .unwrap();
    assert_eq!(message.read_by, vec!["s1".to_string()]);
    assert_eq!(message.seq, 1);

    let reloaded = store.chat_by_id(&chat.id).await.unwrap().unwrap();
    let last = reloaded.last_message.expect("last message should be set");
    assert_eq!(last.id, message.id);
    assert_eq!(last.content, "Hello");
    assert!(reloaded.updated_at >= chat.updated_at);
}

#[tokio::test]
async fn message_order_matches_append_order_under_interleaving() {
    let (store, [s1, _, t1, ..]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    for i in 0..20 {
        let sender = if i % 2 == 0 { &s1 } else { &t1 };
        store
            .append_message(&chat.id, sender, &format!("msg {i}"), MessageType::Text, None, None)
            .await
            .unwrap();
    }

    let messages = store.messages_for(&chat.id, &t1).await.unwrap();
    assert_eq!(messages.len(), 20);
    for (i, message) in messages.iter().enumerate() {
        assert_eq!(message.content, format!("msg {i}"));
        assert_eq!(message.seq, i as i64 + 1);
    }
}

#[tokio::test]
async fn client_key_retry_returns_the_original_message() {
    let (store, [s1, _, t1, ..]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    let first = store
        .append_message(&chat.id, &s1, "once", MessageType::Text, None, Some("key-1"))
        .await
        .unwrap();
    let retried = store
        .append_message(&chat.id, &s1, "once", MessageType::Text, None, Some("key-1"))
        .await
        .unwrap();

    assert_eq!(retried.id, first.id);
    assert_eq!(store.messages_for(&chat.id, &s1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn mark_read_is_monotone_and_idempotent() {
    let (store, [s1, _, t1, ..]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    store
        .append_message(&chat.id, &s1, "one", MessageType::Text, None, None)
        .await
        .unwrap();
    store
        .append_message(&chat.id, &s1, "two", MessageType::Text, None, None)
        .await
        .unwrap();

    store.mark_read(&chat.id, &t1).await.unwrap();
    let after_first = store.messages_for(&chat.id, &t1).await.unwrap();
    for message in &after_first {
        assert!(message.read_by.contains(&"s1".to_string()));
        assert!(message.read_by.contains(&"t1".to_string()));
        assert_eq!(message.read_by.len(), 2);
    }

    // A second pass changes nothing and no one ever leaves the set.
    store.mark_read(&chat.id, &t1).await.unwrap();
    let after_second = store.messages_for(&chat.id, &t1).await.unwrap();
    for (a, b) in after_first.iter().zip(&after_second) {
        assert_eq!(a.read_by.len(), b.read_by.len());
    }
}

#[tokio::test]
async fn non_participants_cannot_read_or_mark() {
    let (store, [s1, s2, t1, _, x1]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    for outsider in [&s2, &x1] {
        assert!(matches!(
            store.messages_for(&chat.id, outsider).await.unwrap_err(),
            ChatError::Forbidden(_)
        ));
        assert!(matches!(
            store.mark_read(&chat.id, outsider).await.unwrap_err(),
            ChatError::Forbidden(_)
        ));
    }
}

#[tokio::test]
async fn list_for_sorts_by_recent_activity() {
    let (store, [s1, s2, t1, ..]) = seeded_store().await;
    let (first, _) = store.create_or_get(&s1, &t1.id).await.unwrap();
    let (second, _) = store.create_or_get(&s2, &t1.id).await.unwrap();

    // Activity in the older chat moves it back to the top.
    store
        .append_message(&first.id, &s1, "ping", MessageType::Text, None, None)
        .await
        .unwrap();

    let chats = store.list_for(&t1).await.unwrap();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].id, first.id);
    assert_eq!(chats[1].id, second.id);

    // Participants only see their own chats.
    let chats = store.list_for(&s2).await.unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].id, second.id);
}

#[tokio::test]
async fn archive_is_an_explicit_transition() {
    let (store, [s1, _, t1, ..]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    store.set_status(&chat.id, ChatStatus::Archived).await.unwrap();
    let reloaded = store.chat_by_id(&chat.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, ChatStatus::Archived);

    assert!(matches!(
        store.set_status("missing", ChatStatus::Archived).await.unwrap_err(),
        ChatError::NotFound(_)
    ));
}

#[tokio::test]
async fn mentorship_updates_merge_and_append_notes() {
    let (store, [s1, s2, t1, ..]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    let update = MentorshipUpdate {
        goals: Some(vec!["resume review".into(), "mock interview".into()]),
        progress: Some(Progress::InProgress),
        ..Default::default()
    };
    let chat1 = store.update_mentorship(&chat.id, &t1, update).await.unwrap();
    assert_eq!(chat1.mentorship.goals.len(), 2);
    assert_eq!(chat1.mentorship.progress, Progress::InProgress);

    let update = MentorshipUpdate {
        add_meeting_note: Some(MeetingNote {
            date: Utc::now(),
            notes: "kickoff".into(),
            action_items: vec!["share resume".into()],
        }),
        ..Default::default()
    };
    let chat2 = store.update_mentorship(&chat.id, &t1, update).await.unwrap();
    // Earlier fields survive an unrelated update; notes accumulate.
    assert_eq!(chat2.mentorship.goals.len(), 2);
    assert_eq!(chat2.mentorship.meeting_notes.len(), 1);

    assert!(matches!(
        store
            .update_mentorship(&chat.id, &s2, MentorshipUpdate::default())
            .await
            .unwrap_err(),
        ChatError::Forbidden(_)
    ));
}

#[tokio::test]
async fn typed_messages_round_trip_their_metadata() {
    let (store, [s1, _, t1, ..]) = seeded_store().await;
    let (chat, _) = store.create_or_get(&s1, &t1.id).await.unwrap();

    let err = store
        .append_message(&chat.id, &t1, "read this", MessageType::Resource, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidInput(_)));

    store
        .append_message(
            &chat.id,
            &t1,
            "read this",
            MessageType::Resource,
            Some(MessageMetadata {
                resource_url: Some("https://example.edu/guide.pdf".into()),
                resource_type: Some("pdf".into()),
                ..Default::default()
            }),
            None,
        )
        .await
        .unwrap();

    store
        .append_message(
            &chat.id,
            &t1,
            "tighten the summary section",
            MessageType::Feedback,
            Some(MessageMetadata {
                feedback_type: Some(FeedbackType::Career),
                ..Default::default()
            }),
            None,
        )
        .await
        .unwrap();

    let messages = store.messages_for(&chat.id, &s1).await.unwrap();
    assert_eq!(messages.len(), 2);

    let resource = &messages[0];
    assert_eq!(resource.message_type, MessageType::Resource);
    assert_eq!(
        resource.metadata.as_ref().unwrap().resource_url.as_deref(),
        Some("https://example.edu/guide.pdf")
    );

    let feedback = &messages[1];
    assert_eq!(feedback.message_type, MessageType::Feedback);
    assert_eq!(
        feedback.metadata.as_ref().unwrap().priority,
        Some(Priority::Medium)
    );
}
