use pipesecret::client::ClientError;
use pipesecret::config::DEFAULT_QUERY;
use pipesecret::protocol::ErrorCode;
use pipesecret_tests::harness::items::{FakeItems, login_item};
use pipesecret_tests::harness::tunnel::TestTunnel;
use pipesecret_tests::harness::{connect, rpc_code};

fn items() -> FakeItems {
    FakeItems::new([("test1", login_item("username1", "my_password1"))])
}

#[tokio::test]
async fn two_field_query_returns_username_and_password() {
    let tunnel = TestTunnel::spawn(items()).await.unwrap();
    let mut client = connect(&tunnel.socket_path).await;

    let fields = client.get_query_item("test1", DEFAULT_QUERY).await.unwrap();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields["username"], "username1");
    assert_eq!(fields["password"], "my_password1");
}

#[tokio::test]
async fn raw_output_keeps_every_query_result() {
    let tunnel = TestTunnel::spawn(items()).await.unwrap();
    let mut client = connect(&tunnel.socket_path).await;

    let raw = client
        .get_query_item_raw("test1", ".fields[].id")
        .await
        .unwrap();
    assert_eq!(raw, "\"username\"\n\"password\"\n\"notesPlain\"\n");
}

#[tokio::test]
async fn lookup_failures_are_rpc_errors_and_the_tunnel_survives() {
    let tunnel = TestTunnel::spawn(items()).await.unwrap();
    let mut client = connect(&tunnel.socket_path).await;

    let err = client.get_query_item_raw("missing", ".").await.unwrap_err();
    assert_eq!(rpc_code(&err), ErrorCode::InvalidRequest);
    assert!(err.to_string().contains("missing"), "got {err}");

    let err = client.get_query_item_raw("test1", ".[").await.unwrap_err();
    assert_eq!(rpc_code(&err), ErrorCode::InvalidRequest);

    // The whole item is not a flat object of strings.
    let err = client.get_query_item("test1", ".").await.unwrap_err();
    assert!(matches!(err, ClientError::Shape(_)), "got {err}");

    let fields = client.get_query_item("test1", DEFAULT_QUERY).await.unwrap();
    assert_eq!(fields["username"], "username1");
}
