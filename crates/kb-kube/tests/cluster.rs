//! Live-cluster tests
//!
//! These need a reachable cluster from the local kubeconfig and are ignored
//! by default. Run with `cargo test -p kb-kube -- --ignored`.

use k8s_openapi::api::core::v1::{Namespace, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use maplit::btreemap;

use kb_core::traits::ClusterClient;
use kb_kube::KubeClusterClient;

fn random_suffix(len: usize) -> String {
    use rand::Rng;

    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Runs a test in a fresh namespace that is deleted afterwards
async fn with_temp_ns<F, Fut>(test: F)
where
    F: FnOnce(KubeClusterClient) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let client = kube::Client::try_default()
        .await
        .expect("failed to initialize k8s client");
    let namespaces = Api::<Namespace>::all(client.clone());
    let name = format!("k-bridge-test-{}", random_suffix(6));

    namespaces
        .create(
            &PostParams::default(),
            &Namespace {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .expect("failed to create namespace");

    let res = tokio::spawn(test(KubeClusterClient::new(client, name.clone()))).await;

    namespaces
        .delete(&name, &DeleteParams::background())
        .await
        .expect("failed to delete namespace");
    if let Err(err) = res {
        std::panic::resume_unwind(err.into_panic());
    }
}

fn web_service(app: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(btreemap! { "app".to_string() => app.to_string() }),
            ports: Some(vec![ServicePort {
                port: 8080,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn service_create_replace_delete() {
    with_temp_ns(|cluster| async move {
        assert!(cluster.get_service("web").await.unwrap().is_none());

        cluster
            .create_or_replace_service(&web_service("web"))
            .await
            .expect("create");
        let replaced = cluster
            .create_or_replace_service(&web_service("bridge"))
            .await
            .expect("replace");
        let selector = replaced.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("bridge"));

        cluster.delete_service("web").await.expect("delete");
        cluster.delete_service("web").await.expect("delete twice");
        assert!(cluster.get_service("web").await.unwrap().is_none());
    })
    .await;
}
