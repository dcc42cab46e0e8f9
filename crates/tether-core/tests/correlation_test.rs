// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation across sends, receives and the channel stack.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use serde_json::json;
use tether_core::message::{ContextProperty, INSTANCE_ID_CONTEXT_KEY};
use tether_core::query::{
    CorrelationKeyCalculator, CorrelationQuery, MessageQuerySet, QueryExpression,
    reply_correlation_queries,
};
use tether_core::{
    CorrelationHandle, CorrelationInitializer, ExecutionScope, InstanceKey, Message,
    ReceiveMessage, ReceiveRequest, SendMessage, SendRequest,
};
use uuid::Uuid;

fn account_calculator(action: &str) -> CorrelationKeyCalculator {
    CorrelationKeyCalculator::new(
        "bank",
        vec![CorrelationQuery::for_action(
            action,
            MessageQuerySet::new().with("account", QueryExpression::Body("/account".into())),
        )],
    )
}

fn instance_context(id: Uuid) -> BTreeMap<String, String> {
    BTreeMap::from([(INSTANCE_ID_CONTEXT_KEY.to_string(), id.to_string())])
}

#[test]
fn test_reply_without_action_matches_reply_queries() {
    let queries = reply_correlation_queries(&[CorrelationQuery::for_action(
        "http://bank.example/IBank/BalanceResponse",
        MessageQuerySet::new().with("account", QueryExpression::Body("/account".into())),
    )]);
    assert_eq!(queries.len(), 2);
    let calculator = CorrelationKeyCalculator::new("bank", queries);

    let legacy = Message::without_action().with_body(json!({"account": "A-1"}));
    let current = Message::new("http://bank.example/IBank/BalanceResponse")
        .with_body(json!({"account": "A-1"}));

    let legacy_key = calculator.calculate(&legacy).unwrap().unwrap().key;
    let current_key = calculator.calculate(&current).unwrap().unwrap().key;
    assert_eq!(legacy_key, current_key);

    let unrelated = Message::new("http://bank.example/IBank/Audit").with_body(json!({"account": "A-1"}));
    assert!(calculator.calculate(&unrelated).unwrap().is_none());
}

#[tokio::test]
async fn test_query_key_routes_inbound_message_to_correlated_instance() {
    let ctx = Arc::new(TestContext::new());
    let deposit_action = "http://bank.example/IBank/Deposit";

    // Client side: the send initializes its handle from the outgoing body.
    let client_handle = CorrelationHandle::new("account");
    let definition = SendMessage::new(bank_contract(), "Deposit", bank_endpoint()).unwrap();
    ctx.send
        .send(
            &definition,
            SendRequest::new(Message::without_action().with_body(json!({"account": "A-1", "amount": 5})))
                .initialize(CorrelationInitializer::Query {
                    handle: client_handle.clone(),
                    calculator: account_calculator(deposit_action),
                }),
            &ExecutionScope::new(Uuid::new_v4()),
        )
        .await
        .unwrap();

    let transmitted = ctx.provider.transport().transmitted().remove(0);
    let client_key = client_handle.instance_key().unwrap();
    assert_eq!(
        transmitted.properties().correlation.as_ref().map(|c| &c.correlation_key),
        Some(&client_key)
    );

    // Server side: the instance waits on a handle holding the same key; the
    // dispatcher computes it from the body again.
    let receive = ReceiveMessage::new(bank_contract(), "Deposit")
        .unwrap()
        .with_correlation(account_calculator(deposit_action));
    ctx.dispatcher.register(&receive);

    let instance = InstanceKey::new(Uuid::new_v4());
    ctx.bookmarks.register_instance(&instance);
    let scope = ExecutionScope::new(instance.id()).with_instance_key(instance.clone());
    let server_handle = CorrelationHandle::new("account");
    server_handle.initialize_key(client_key.clone());

    let workflow = tokio::spawn({
        let ctx = ctx.clone();
        let receive = receive.clone();
        async move {
            ctx.receive
                .receive(&receive, ReceiveRequest::new().correlates_with(server_handle), &scope)
                .await
        }
    });
    wait_for_bookmark(&ctx.bookmarks, &instance, &receive.bookmark_name()).await;

    let mut inbound = Message::new(deposit_action).with_body(transmitted.body().clone());
    inbound.properties_mut().correlation = None;
    ctx.dispatcher
        .dispatch("IBank", "Deposit", inbound, None)
        .await
        .unwrap();

    let delivery = workflow.await.unwrap().unwrap();
    assert_eq!(delivery.message.body()["amount"], 5);
}

#[tokio::test]
async fn test_context_from_channel_initializes_handle_before_transmission() {
    let ctx = TestContext::new();
    let remote_instance = Uuid::new_v4();
    ctx.provider
        .transport()
        .set_channel_context(Some(instance_context(remote_instance)));

    let definition = SendMessage::new(bank_contract(), "Deposit", bank_endpoint())
        .unwrap()
        .with_correlation_send_names(vec![INSTANCE_ID_CONTEXT_KEY.to_string()]);
    let handle = CorrelationHandle::new("conversation");

    ctx.send
        .send(
            &definition,
            SendRequest::new(Message::without_action().with_body(json!({"amount": 1})))
                .initialize(CorrelationInitializer::Context(handle.clone())),
            &ExecutionScope::new(Uuid::new_v4()),
        )
        .await
        .unwrap();

    let expected = InstanceKey::new(remote_instance);
    assert_eq!(handle.instance_key(), Some(expected.clone()));
    assert_eq!(
        handle.context().and_then(|c| c.instance_id().map(str::to_string)),
        Some(remote_instance.to_string())
    );

    let transmitted = ctx.provider.transport().transmitted();
    assert_eq!(transmitted.len(), 1);
    assert!(transmitted[0].properties().correlation_callback.is_none());
    assert_eq!(
        transmitted[0]
            .properties()
            .correlation
            .as_ref()
            .map(|c| c.correlation_key.clone()),
        Some(expected)
    );
}

#[tokio::test]
async fn test_deferred_query_correlation_on_two_way_send() {
    let ctx = TestContext::new();
    let definition = SendMessage::new(bank_contract(), "Balance", bank_endpoint())
        .unwrap()
        .with_correlation_send_names(vec!["account".to_string()]);
    let reply_handle = CorrelationHandle::new("balance");
    let account_handle = CorrelationHandle::new("account");
    let scope = ExecutionScope::new(Uuid::new_v4());

    ctx.send
        .send(
            &definition,
            SendRequest::new(Message::without_action().with_body(json!({"account": "A-7"})))
                .initialize(CorrelationInitializer::RequestReply(reply_handle.clone()))
                .initialize(CorrelationInitializer::Query {
                    handle: account_handle.clone(),
                    calculator: account_calculator("http://bank.example/IBank/Balance"),
                }),
            &scope,
        )
        .await
        .unwrap();

    let key = account_handle.instance_key().unwrap();
    let transmitted = ctx.provider.transport().transmitted();
    let correlation = transmitted[0].properties().correlation.clone().unwrap();
    assert_eq!(correlation.correlation_key, key);
    assert!(correlation.request_reply_key().is_some());

    let reply = ctx
        .receive
        .receive_reply(ReceiveRequest::new().correlates_with(reply_handle), &scope)
        .await
        .unwrap();
    assert_eq!(reply.action(), Some("http://bank.example/IBank/BalanceResponse"));
}

#[tokio::test]
async fn test_receive_context_initializer_associates_key_with_instance() {
    let ctx = Arc::new(TestContext::new());
    let deposit = ReceiveMessage::new(bank_contract(), "Deposit").unwrap();
    ctx.dispatcher.register(&deposit);

    let instance = InstanceKey::new(Uuid::new_v4());
    ctx.bookmarks.register_instance(&instance);
    let scope = ExecutionScope::new(instance.id()).with_instance_key(instance.clone());
    let partner = Uuid::new_v4();
    let handle = CorrelationHandle::new("partner");

    let workflow = tokio::spawn({
        let ctx = ctx.clone();
        let deposit = deposit.clone();
        let handle = handle.clone();
        let scope = scope.clone();
        async move {
            ctx.receive
                .receive(
                    &deposit,
                    ReceiveRequest::new().initialize(CorrelationInitializer::Context(handle)),
                    &scope,
                )
                .await
        }
    });
    wait_for_bookmark(&ctx.bookmarks, &instance, &deposit.bookmark_name()).await;

    let mut first = keyed_message("Deposit", &instance, json!({"amount": 1}));
    first.properties_mut().context = Some(ContextProperty::new(instance_context(partner)));
    ctx.dispatcher.dispatch("IBank", "Deposit", first, None).await.unwrap();
    workflow.await.unwrap().unwrap();

    let partner_key = InstanceKey::new(partner);
    assert_eq!(handle.instance_key(), Some(partner_key.clone()));

    // Later messages addressed by the partner's key reach the same instance.
    let second = tokio::spawn({
        let ctx = ctx.clone();
        let deposit = deposit.clone();
        async move { ctx.receive.receive(&deposit, ReceiveRequest::new(), &scope).await }
    });
    wait_for_bookmark(&ctx.bookmarks, &instance, &deposit.bookmark_name()).await;

    ctx.dispatcher
        .dispatch(
            "IBank",
            "Deposit",
            keyed_message("Deposit", &partner_key, json!({"amount": 2})),
            None,
        )
        .await
        .unwrap();
    let delivery = second.await.unwrap().unwrap();
    assert_eq!(delivery.message.body()["amount"], 2);
}

#[tokio::test]
async fn test_context_initialized_reply_carries_instance_id() {
    let ctx = Arc::new(TestContext::new());
    let balance = ReceiveMessage::new(bank_contract(), "Balance").unwrap();
    ctx.dispatcher.register(&balance);

    let instance = InstanceKey::new(Uuid::new_v4());
    ctx.bookmarks.register_instance(&instance);
    let scope = ExecutionScope::new(instance.id()).with_instance_key(instance.clone());

    let workflow = tokio::spawn({
        let ctx = ctx.clone();
        let balance = balance.clone();
        async move {
            let reply_handle = CorrelationHandle::new("balance-request");
            let conversation = CorrelationHandle::new("conversation");
            ctx.receive
                .receive(
                    &balance,
                    ReceiveRequest::new()
                        .initialize(CorrelationInitializer::RequestReply(reply_handle.clone())),
                    &scope,
                )
                .await?;
            ctx.send
                .send_reply(
                    &balance,
                    SendRequest::new(Message::without_action().with_body(json!({"balance": 3})))
                        .correlates_with(reply_handle)
                        .initialize(CorrelationInitializer::Context(conversation.clone())),
                    &scope,
                )
                .await?;
            Ok::<_, tether_core::TetherError>(conversation)
        }
    });
    wait_for_bookmark(&ctx.bookmarks, &instance, &balance.bookmark_name()).await;

    let reply = ctx
        .dispatcher
        .dispatch(
            "IBank",
            "Balance",
            keyed_message("Balance", &instance, json!({})),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let announced = reply
        .properties()
        .context
        .as_ref()
        .and_then(|c| c.instance_id().map(str::to_string));
    assert_eq!(announced, Some(instance.id().to_string()));

    let conversation = workflow.await.unwrap().unwrap();
    assert_eq!(conversation.instance_key(), Some(instance));
}

#[tokio::test]
async fn test_receive_reply_correlates_reply_without_action() {
    let ctx = TestContext::new();
    ctx.provider
        .transport()
        .set_responder(|_| Ok(Message::without_action().with_body(json!({"account": "A-3", "balance": 12}))));

    let definition = SendMessage::new(bank_contract(), "Balance", bank_endpoint()).unwrap();
    let reply_handle = CorrelationHandle::new("balance");
    let account_handle = CorrelationHandle::new("account");
    let scope = ExecutionScope::new(Uuid::new_v4());

    ctx.send
        .send(
            &definition,
            SendRequest::new(Message::without_action().with_body(json!({"account": "A-3"})))
                .initialize(CorrelationInitializer::RequestReply(reply_handle.clone())),
            &scope,
        )
        .await
        .unwrap();

    let reply_action = "http://bank.example/IBank/BalanceResponse";
    let reply = ctx
        .receive
        .receive_reply(
            ReceiveRequest::new()
                .correlates_with(reply_handle)
                .initialize(CorrelationInitializer::Query {
                    handle: account_handle.clone(),
                    calculator: account_calculator(reply_action),
                }),
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(reply.action(), None);

    let expected = account_calculator(reply_action)
        .calculate(&Message::new(reply_action).with_body(json!({"account": "A-3"})))
        .unwrap()
        .unwrap()
        .key;
    assert_eq!(account_handle.instance_key(), Some(expected));
}

#[tokio::test]
async fn test_receive_reply_runs_context_initializer_on_reply() {
    let ctx = TestContext::new();
    let partner = Uuid::new_v4();
    ctx.provider.transport().set_responder(move |request| {
        let mut reply = Message::new(format!("{}Response", request.resolved_action()));
        reply.properties_mut().context = Some(ContextProperty::new(instance_context(partner)));
        Ok(reply)
    });

    let definition = SendMessage::new(bank_contract(), "Balance", bank_endpoint()).unwrap();
    let reply_handle = CorrelationHandle::new("balance");
    let partner_handle = CorrelationHandle::new("partner");
    let scope = ExecutionScope::new(Uuid::new_v4());

    ctx.send
        .send(
            &definition,
            SendRequest::new(Message::without_action())
                .initialize(CorrelationInitializer::RequestReply(reply_handle.clone())),
            &scope,
        )
        .await
        .unwrap();
    assert!(partner_handle.instance_key().is_none());

    ctx.receive
        .receive_reply(
            ReceiveRequest::new()
                .correlates_with(reply_handle)
                .initialize(CorrelationInitializer::Context(partner_handle.clone())),
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(partner_handle.instance_key(), Some(InstanceKey::new(partner)));
}
