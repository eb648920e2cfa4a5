//! Image resolution against an in-process engine.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;

use berth_common::constants::INDEX_SERVER;
use berth_common::error::BerthError;
use berth_engine::pull::{PullMessage, RegistryCredentials};
use berth_engine::testing::StubEngine;
use berth_image::{ImageResolver, StaticCredentials};

#[tokio::test]
async fn local_image_is_returned_without_pulling() {
    let engine = Arc::new(StubEngine::default().with_local_image("docker.io/library/alpine:3.20"));
    let resolver = ImageResolver::new(engine.clone());

    let resolved = resolver.resolve("alpine:3.20").await.expect("resolve");

    assert_eq!(resolved, "docker.io/library/alpine:3.20");
    assert_eq!(engine.count("pull_image"), 0);
    assert_eq!(engine.calls(), vec!["inspect_image"]);
}

#[tokio::test]
async fn missing_image_is_pulled_with_default_tag_once() {
    let engine = Arc::new(
        StubEngine::default()
            .with_pull_records(vec![PullMessage::status("Status: Downloaded newer image")]),
    );
    let resolver = ImageResolver::new(engine.clone());

    let resolved = resolver.resolve("alpine").await.expect("resolve");

    assert_eq!(resolved, "docker.io/library/alpine:latest");
    let pulls = engine.pulls();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].0, "docker.io/library/alpine:latest");
    assert_eq!(pulls[0].1, None);
}

#[tokio::test]
async fn embedded_pull_error_fails_resolution() {
    let engine = Arc::new(StubEngine::default().with_pull_records(vec![
        PullMessage::status("Pulling from library/nope"),
        PullMessage::failure("x"),
        PullMessage::status("Status: Downloaded newer image"),
    ]));
    let resolver = ImageResolver::new(engine);

    let err = resolver.resolve("nope").await.expect_err("pull fails");

    match err {
        BerthError::Pull { reference, message } => {
            assert_eq!(message, "x");
            assert_eq!(reference, "docker.io/library/nope:latest");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn malformed_name_fails_before_any_engine_call() {
    let engine = Arc::new(StubEngine::default());
    let resolver = ImageResolver::new(engine.clone());

    let err = resolver.resolve("Not/A:Valid:Name").await.expect_err("bad name");

    assert!(matches!(err, BerthError::Reference { .. }));
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn docker_hub_pulls_send_index_credentials() {
    let engine = Arc::new(StubEngine::default());
    let credentials = StaticCredentials::new().with(
        INDEX_SERVER,
        RegistryCredentials {
            username: Some("me".into()),
            password: Some("pw".into()),
            ..RegistryCredentials::default()
        },
    );
    let resolver = ImageResolver::new(engine.clone()).with_credentials(Arc::new(credentials));

    let _ = resolver.resolve("me/tool:1.0").await.expect("resolve");

    let sent = engine.pulls()[0].1.clone().expect("credentials sent");
    assert_eq!(sent.username.as_deref(), Some("me"));
    assert_eq!(sent.server_address.as_deref(), Some(INDEX_SERVER));
}
