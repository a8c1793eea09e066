mod common;

use common::{setup_cluster, setup_cluster_with_init};
use pretty_assertions::assert_eq;
use rwsplit::{Context, Error, Row, Value};
use std::time::Duration;

const SCHEMA: &str = "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, nickname TEXT, score REAL, avatar BLOB);";

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[tokio::test]
async fn test_end_to_end_insert_then_read() {
    let cluster = setup_cluster_with_init(0, SCHEMA).await;
    let client = &cluster.client;

    let first = client
        .exec(
            "INSERT INTO people (name, nickname, score, avatar) VALUES (?1, ?2, ?3, ?4)",
            &[
                Value::Text("Ada".into()),
                Value::Null,
                Value::Real(9.5),
                Value::Blob(b"png".to_vec()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(first.last_insert_id().unwrap(), 1);

    let second = client
        .exec("INSERT INTO people (name, nickname) VALUES ('Grace', 'amazing')", &[])
        .await
        .unwrap();
    assert_eq!(second.rows_affected().unwrap(), 1);
    assert_eq!(second.last_insert_id().unwrap(), 2);

    let mut result = client
        .query("SELECT id, name, nickname, score, avatar FROM people ORDER BY id", &[])
        .await
        .unwrap();
    assert!(result.is_row_set());
    assert!(matches!(result.rows_affected(), Err(Error::NoMutationOutcome)));

    let rows = result.rows().await.unwrap();
    assert_eq!(
        rows,
        vec![
            row(&[("id", "1"), ("name", "Ada"), ("nickname", ""), ("score", "9.5"), ("avatar", "png")]),
            row(&[("id", "2"), ("name", "Grace"), ("nickname", "amazing"), ("score", ""), ("avatar", "")]),
        ]
    );

    // consumed cursors give nothing more
    assert!(result.is_consumed());
    assert_eq!(result.rows().await.unwrap(), Vec::<Row>::new());
    assert_eq!(result.row().await.unwrap(), Row::new());
}

#[tokio::test]
async fn test_row_maps_null_to_empty() {
    let cluster = setup_cluster_with_init(0, SCHEMA).await;
    let client = &cluster.client;
    client
        .exec("INSERT INTO people (name, nickname) VALUES ('Linus', NULL)", &[])
        .await
        .unwrap();

    let mut result = client
        .query("SELECT name, nickname, score FROM people", &[])
        .await
        .unwrap();
    assert_eq!(
        result.row().await.unwrap(),
        row(&[("name", "Linus"), ("nickname", ""), ("score", "")])
    );
}

#[tokio::test]
async fn test_mutation_result_has_no_rows() {
    let cluster = setup_cluster_with_init(0, SCHEMA).await;

    let mut result = cluster
        .client
        .exec("DELETE FROM people", &[])
        .await
        .unwrap();
    assert!(!result.is_row_set());
    assert_eq!(result.row().await.unwrap(), Row::new());
    assert!(result.rows().await.unwrap().is_empty());
    assert_eq!(result.rows_affected().unwrap(), 0);
}

#[tokio::test]
async fn test_zero_columns() {
    let cluster = setup_cluster(0).await;

    let mut result = cluster
        .client
        .query("CREATE TABLE scratch (id INTEGER)", &[])
        .await
        .unwrap();
    assert!(result.columns().is_empty());
    assert!(matches!(result.row().await, Err(Error::NoColumnsFound)));
    assert!(matches!(result.rows().await, Err(Error::NoColumnsFound)));
}

#[tokio::test]
async fn test_empty_row_set() {
    let cluster = setup_cluster_with_init(0, SCHEMA).await;

    let mut result = cluster
        .client
        .query("SELECT name FROM people WHERE id = ?1", &[Value::Integer(42)])
        .await
        .unwrap();
    assert_eq!(result.columns(), &["name".to_string()][..]);
    assert_eq!(result.row().await.unwrap(), Row::new());
}

#[tokio::test]
async fn test_unmarshal_is_not_implemented() {
    let cluster = setup_cluster(0).await;

    let result = cluster.client.query("SELECT 1 AS one", &[]).await.unwrap();
    let mut target = Vec::<String>::new();
    let err = result.unmarshal(&mut target).unwrap_err();
    assert!(matches!(err, Error::NotImplemented));
    assert!(target.is_empty());
}

#[tokio::test]
async fn test_row_releases_connection_early() {
    let cluster = setup_cluster_with_init(0, SCHEMA).await;
    let client = &cluster.client;
    for i in 0..300 {
        client
            .exec("INSERT INTO people (name) VALUES (?1)", &[Value::Text(format!("p{}", i))])
            .await
            .unwrap();
    }

    let primary = client.get_primary();
    let mut result = client.query("SELECT name FROM people ORDER BY id", &[]).await.unwrap();
    assert_eq!(primary.active_connections(), 1);
    assert_eq!(result.row().await.unwrap()["name"], "p0");

    for _ in 0..100 {
        if primary.active_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(primary.active_connections(), 0);
}

#[tokio::test]
async fn test_expired_context_fails_before_running() {
    let cluster = setup_cluster_with_init(0, SCHEMA).await;
    let ctx = Context::with_timeout(Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = cluster
        .client
        .exec_with_context(&ctx, "INSERT INTO people (name) VALUES ('late')", &[])
        .await
        .unwrap_err();
    assert!(err.is_context_error());

    let mut result = cluster
        .client
        .query("SELECT count(*) AS n FROM people", &[])
        .await
        .unwrap();
    assert_eq!(result.row().await.unwrap()["n"], "0");
}
