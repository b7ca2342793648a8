#![allow(
    clippy::unwrap_used,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use httpmock::MockServer;
use reqwest::{Method, StatusCode};
use rest_ratelimit::error::{Kind, Status};
use rest_ratelimit::rest::{Body, Client, Config, Params, Request, Route};
use serde::Deserialize;
use serde_json::json;

use crate::common::{create_client, prepare};

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    content: String,
}

mod success {
    use super::*;

    #[tokio::test]
    async fn execute_json_should_deserialize_body() -> anyhow::Result<()> {
        let server = MockServer::start();
        let client = create_client(&server);

        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/channels/7/messages")
                .json_body(json!({ "content": "hello" }));
            then.status(StatusCode::OK)
                .json_body(json!({ "id": "99", "content": "hello" }));
        });

        let (url, bucket) = client.resolve(
            &Method::POST,
            &Route::new("/channels/{channel_id}/messages"),
            &Params::new().with("channel_id", 7),
        )?;
        let request = Request::builder()
            .method(Method::POST)
            .url(url)
            .body(Body::json(&json!({ "content": "hello" }))?)
            .build();

        let message: Message = client.execute_json(bucket, request).await?;

        assert_eq!(message.id, "99");
        assert_eq!(message.content, "hello");
        mock.assert();

        Ok(())
    }

    #[tokio::test]
    async fn default_headers_should_be_sent() -> anyhow::Result<()> {
        let server = MockServer::start();
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("authorization", "Bot token".parse()?);
        let client = Client::new(
            &server.base_url(),
            Config::builder()
                .headers(headers)
                .user_agent("tests/1.0")
                .build(),
        )?;

        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/gateway")
                .header("authorization", "Bot token")
                .header("user-agent", "tests/1.0");
            then.status(StatusCode::OK);
        });

        let (bucket, request) = prepare(&client, Method::GET, "/gateway", &Params::new());
        client.execute(bucket, request).await?;
        mock.assert();

        Ok(())
    }

    #[tokio::test]
    async fn handle_should_be_released_after_execution() -> anyhow::Result<()> {
        let server = MockServer::start();
        let client = create_client(&server);

        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/gateway");
            then.status(StatusCode::NOT_FOUND);
        });

        let (bucket, request) = prepare(&client, Method::GET, "/gateway", &Params::new());
        let shared = bucket.bucket();
        assert_eq!(shared.in_flight(), 1);

        client.execute(bucket, request).await.unwrap_err();
        assert_eq!(shared.in_flight(), 0, "released on failure too");

        Ok(())
    }
}

mod errors {
    use super::*;

    #[tokio::test]
    async fn status_codes_should_be_classified() -> anyhow::Result<()> {
        let server = MockServer::start();
        let client = create_client(&server);

        for (path, status, kind) in [
            ("/bad", StatusCode::BAD_REQUEST, Kind::BadRequest),
            ("/auth", StatusCode::UNAUTHORIZED, Kind::Unauthorized),
            ("/missing", StatusCode::NOT_FOUND, Kind::NotFound),
            ("/large", StatusCode::PAYLOAD_TOO_LARGE, Kind::PayloadTooLarge),
            ("/broken", StatusCode::BAD_GATEWAY, Kind::Server),
            ("/forbidden", StatusCode::FORBIDDEN, Kind::Status),
        ] {
            server.mock(|when, then| {
                when.method(httpmock::Method::GET).path(path);
                then.status(status).body("nope");
            });

            let (bucket, request) = prepare(&client, Method::GET, path, &Params::new());
            let err = client.execute(bucket, request).await.unwrap_err();

            assert_eq!(err.kind(), kind, "{path}");
            let details = err.downcast_ref::<Status>().unwrap();
            assert_eq!(details.status_code, status);
            assert_eq!(details.path, path);
            assert_eq!(details.message, "nope");
        }

        Ok(())
    }

    #[tokio::test]
    async fn missing_placeholder_should_fail_validation() {
        let server = MockServer::start();
        let client = create_client(&server);

        let err = client
            .resolve(
                &Method::GET,
                &Route::new("/guilds/{guild_id}"),
                &Params::new(),
            )
            .unwrap_err();

        assert_eq!(err.kind(), Kind::Validation);
        assert!(client.registry().is_empty(), "nothing registered");
    }

    #[tokio::test]
    async fn unexpected_body_should_name_the_field() -> anyhow::Result<()> {
        let server = MockServer::start();
        let client = create_client(&server);

        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/channels/1/messages/2");
            then.status(StatusCode::OK)
                .json_body(json!({ "id": "2", "content": 5 }));
        });

        let (bucket, request) = prepare(
            &client,
            Method::GET,
            "/channels/{channel_id}/messages/{message_id}",
            &Params::new().with("channel_id", 1).with("message_id", 2),
        );
        let err = client
            .execute_json::<Message>(bucket, request)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Kind::Internal);
        assert!(err.to_string().contains("content"), "{err}");

        Ok(())
    }

    #[test]
    fn invalid_host_should_fail() {
        let err = Client::new("not a url", Config::default()).unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);
    }
}
