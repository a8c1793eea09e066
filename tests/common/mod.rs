use rwsplit::{Client, Config};
use tempfile::TempDir;

/// A primary plus replicas, each its own SQLite file in a scratch directory.
pub struct TestCluster {
    pub client: Client,
    pub dir: TempDir,
}

impl TestCluster {
    #[allow(dead_code)]
    pub fn config(&self, db_name: &str) -> Config {
        Config::new(self.dir.path().to_string_lossy(), db_name, "", "")
    }
}

/// Setup a client with `replicas` file-backed replicas registered
pub async fn setup_cluster(replicas: usize) -> TestCluster {
    setup_cluster_with_init(replicas, "").await
}

/// Setup a client and run `schema` on the primary and every replica before
/// any replica is registered
pub async fn setup_cluster_with_init(replicas: usize, schema: &str) -> TestCluster {
    let dir = TempDir::new().unwrap();
    let config = |name: &str| Config::new(dir.path().to_string_lossy(), name, "", "");

    let names: Vec<String> = (0..replicas).map(|i| format!("replica{}.db", i)).collect();
    if !schema.is_empty() {
        for name in std::iter::once("primary.db").chain(names.iter().map(String::as_str)) {
            let conn = rusqlite::Connection::open(dir.path().join(name)).unwrap();
            conn.execute_batch(schema).unwrap();
        }
    }

    let client = Client::new(config("primary.db")).await.unwrap();
    for name in &names {
        client.register_replica(Some(config(name))).await.unwrap();
    }

    TestCluster { client, dir }
}
