use std::convert::Infallible;
use std::sync::Arc;

use warp::Filter;
use warp::http::StatusCode;

use crate::dhcp::LeasePool;
use crate::dns::Resolver;
use crate::metrics::Metrics;
use crate::web::schemas;

pub async fn leases_handler(pool: Arc<LeasePool>) -> Result<impl warp::Reply, Infallible> {
    let report = schemas::LeaseReport {
        active: pool.active_leases().await,
        reserved: pool.reserved_leases().await,
    };
    Ok(warp::reply::json(&report))
}

pub async fn blocklist_handler(resolver: Arc<Resolver>) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&resolver.blocklist().await))
}

pub async fn add_blocklist_handler(
    resolver: Arc<Resolver>,
    update: schemas::BlocklistUpdate,
) -> Result<impl warp::Reply, Infallible> {
    resolver.add_blocklist_entries(update.domains).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_blocklist_handler(
    domain: String,
    resolver: Arc<Resolver>,
) -> Result<impl warp::Reply, Infallible> {
    resolver.delete_blocklist_entry(&domain).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn local_domains_handler(
    resolver: Arc<Resolver>,
) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&resolver.local_domains().await))
}

pub async fn add_local_domain_handler(
    resolver: Arc<Resolver>,
    entry: schemas::LocalDomainEntry,
) -> Result<impl warp::Reply, Infallible> {
    match resolver.add_local_domain(&entry.domain, entry.ip).await {
        Ok(()) => {
            // Cached upstream answers would shadow the new mapping.
            resolver.flush_cache().await;
            Ok(StatusCode::NO_CONTENT)
        }
        Err(_) => Ok(StatusCode::BAD_REQUEST),
    }
}

pub async fn delete_local_domain_handler(
    domain: String,
    resolver: Arc<Resolver>,
) -> Result<impl warp::Reply, Infallible> {
    resolver.delete_local_domain(&domain).await;
    resolver.flush_cache().await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn metrics_handler(metrics: Arc<Metrics>) -> Result<impl warp::Reply, Infallible> {
    match metrics.render() {
        Ok(body) => Ok(warp::reply::with_status(
            String::from_utf8_lossy(&body).to_string(),
            StatusCode::OK,
        )),
        Err(render_error) => Ok(warp::reply::with_status(
            render_error.to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )),
    }
}

fn with_pool(
    pool: Arc<LeasePool>,
) -> impl Filter<Extract = (Arc<LeasePool>,), Error = Infallible> + Clone {
    warp::any().map(move || pool.clone())
}

fn with_resolver(
    resolver: Arc<Resolver>,
) -> impl Filter<Extract = (Arc<Resolver>,), Error = Infallible> + Clone {
    warp::any().map(move || resolver.clone())
}

fn with_metrics(
    metrics: Arc<Metrics>,
) -> impl Filter<Extract = (Arc<Metrics>,), Error = Infallible> + Clone {
    warp::any().map(move || metrics.clone())
}

pub fn routes(
    pool: Arc<LeasePool>,
    resolver: Arc<Resolver>,
    metrics: Arc<Metrics>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let leases = warp::path!("api" / "v1" / "leases")
        .and(warp::get())
        .and(with_pool(pool))
        .and_then(leases_handler);

    let blocklist = warp::path!("api" / "v1" / "dns" / "blocklist")
        .and(warp::get())
        .and(with_resolver(resolver.clone()))
        .and_then(blocklist_handler);

    let add_blocklist = warp::path!("api" / "v1" / "dns" / "blocklist")
        .and(warp::post())
        .and(with_resolver(resolver.clone()))
        .and(warp::body::json())
        .and_then(add_blocklist_handler);

    let delete_blocklist = warp::path!("api" / "v1" / "dns" / "blocklist" / String)
        .and(warp::delete())
        .and(with_resolver(resolver.clone()))
        .and_then(delete_blocklist_handler);

    let local_domains = warp::path!("api" / "v1" / "dns" / "local")
        .and(warp::get())
        .and(with_resolver(resolver.clone()))
        .and_then(local_domains_handler);

    let add_local_domain = warp::path!("api" / "v1" / "dns" / "local")
        .and(warp::post())
        .and(with_resolver(resolver.clone()))
        .and(warp::body::json())
        .and_then(add_local_domain_handler);

    let delete_local_domain = warp::path!("api" / "v1" / "dns" / "local" / String)
        .and(warp::delete())
        .and(with_resolver(resolver))
        .and_then(delete_local_domain_handler);

    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .and(with_metrics(metrics))
        .and_then(metrics_handler);

    leases
        .or(blocklist)
        .or(add_blocklist)
        .or(delete_blocklist)
        .or(local_domains)
        .or(add_local_domain)
        .or(delete_local_domain)
        .or(metrics_route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn test_state() -> (Arc<LeasePool>, Arc<Resolver>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = Arc::new(LeasePool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 10),
        ));
        let resolver = Arc::new(Resolver::new(
            Vec::new(),
            HashMap::new(),
            Arc::clone(&metrics),
        ));
        (pool, resolver, metrics)
    }

    #[tokio::test]
    async fn test_leases_endpoint() {
        let (pool, resolver, metrics) = test_state();
        pool.reserve_lease("00:11:22:33:44:55", Ipv4Addr::new(10, 0, 0, 100))
            .await
            .unwrap();
        let filter = routes(pool, resolver, metrics);

        let response = warp::test::request()
            .path("/api/v1/leases")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["reserved"][0]["client_id"], "00:11:22:33:44:55");
        assert_eq!(body["active"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_blocklist_crud() {
        let (pool, resolver, metrics) = test_state();
        let filter = routes(pool, Arc::clone(&resolver), metrics);

        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/dns/blocklist")
            .json(&serde_json::json!({"domains": ["ads.example.com"]}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 204);
        assert_eq!(resolver.blocklist_len().await, 1);

        let response = warp::test::request()
            .path("/api/v1/dns/blocklist")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        let body: Vec<String> = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body, vec!["ads.example.com"]);

        let response = warp::test::request()
            .method("DELETE")
            .path("/api/v1/dns/blocklist/ads.example.com")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 204);
        assert_eq!(resolver.blocklist_len().await, 0);
    }

    #[tokio::test]
    async fn test_local_domain_crud() {
        let (pool, resolver, metrics) = test_state();
        let filter = routes(pool, Arc::clone(&resolver), metrics);

        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/dns/local")
            .json(&serde_json::json!({"domain": "nas.lan", "ip": "192.168.1.10"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 204);

        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/dns/local")
            .json(&serde_json::json!({"domain": "bad.lan", "ip": "0.0.0.0"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 400);

        let response = warp::test::request()
            .method("DELETE")
            .path("/api/v1/dns/local/nas.lan")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 204);
        assert!(resolver.local_domains().await.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (pool, resolver, metrics) = test_state();
        metrics.dns_cache_hits.inc();
        let filter = routes(pool, resolver, metrics);

        let response = warp::test::request().path("/metrics").reply(&filter).await;
        assert_eq!(response.status(), 200);
        assert!(
            String::from_utf8_lossy(response.body()).contains("dns_cache_hit_counter")
        );
    }
}
