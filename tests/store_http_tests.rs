//! HTTP-level tests for the store clients, against wiremock servers.

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use lexrag::llm::embeddings::{Embedder, RemoteEmbedder};
use lexrag::stores::neo4j::Neo4jGraphStore;
use lexrag::stores::opensearch::OpenSearchIndex;
use lexrag::stores::qdrant::{HybridFusion, QdrantStore};
use lexrag::stores::{GraphStore, LexicalIndex, VectorStore};
use lexrag::types::{CoreError, ScopeContext, SourceType};

#[tokio::test]
async fn opensearch_search_parses_and_normalizes_hits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rag-lei/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": {
                "max_score": 12.0,
                "hits": [
                    {"_score": 12.0, "_source": {
                        "doc_id": "cpc-319", "position": 0,
                        "text": "Art. 319. A petição inicial indicará...",
                        "metadata": {"title": "CPC"}
                    }},
                    {"_score": 6.0, "_source": {
                        "doc_id": "cpc-320", "position": 0,
                        "text": "Art. 320."
                    }}
                ]
            }
        })))
        .mount(&server)
        .await;

    let index = OpenSearchIndex::new(server.uri(), "admin", "admin");
    let hits = index
        .search(
            "Art. 319",
            SourceType::Statute,
            10,
            &ScopeContext::global("t1"),
        )
        .await
        .unwrap();

    assert_eq!(hits.len(), 2);
    assert!((hits[0].score - 1.0).abs() < f32::EPSILON);
    assert!((hits[1].score - 0.5).abs() < f32::EPSILON);
    assert_eq!(hits[0].chunk.metadata.title, "CPC");
}

#[tokio::test]
async fn opensearch_query_carries_visibility_filter() {
    let server = MockServer::start().await;
    // The responder rejects any request whose body lacks the server-side
    // visibility predicate, so a missing filter fails the search below.
    Mock::given(method("POST"))
        .and(path("/rag-juris/_search"))
        .respond_with(|req: &Request| {
            let body: serde_json::Value =
                serde_json::from_slice(&req.body).unwrap_or_default();
            let filter = body["query"]["bool"]["filter"][0]["bool"].to_string();
            let sigilo_excluded = filter.contains("sigilo");
            let tenant_bound = filter.contains("tenant-7");
            if sigilo_excluded && tenant_bound {
                ResponseTemplate::new(200).set_body_json(json!({"hits": {"hits": []}}))
            } else {
                ResponseTemplate::new(500)
            }
        })
        .mount(&server)
        .await;

    let index = OpenSearchIndex::new(server.uri(), "admin", "admin");
    let hits = index
        .search(
            "responsabilidade",
            SourceType::CaseLaw,
            10,
            &ScopeContext::global("tenant-7"),
        )
        .await
        .expect("request must carry the visibility filter");
    assert!(hits.is_empty());
}

#[tokio::test]
async fn opensearch_http_error_is_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let index = OpenSearchIndex::new(server.uri(), "admin", "admin");
    let result = index
        .search("q", SourceType::Statute, 10, &ScopeContext::global("t1"))
        .await;
    assert!(matches!(result, Err(CoreError::Upstream(_))));
}

#[tokio::test]
async fn qdrant_dense_query_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/juris/points/query"))
        .and(body_partial_json(json!({"with_payload": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": {"points": [
                {"score": 0.87, "payload": {
                    "doc_id": "resp-1", "position": 3, "text": "precedente aplicável"
                }}
            ]}
        })))
        .mount(&server)
        .await;

    let store = QdrantStore::new(server.uri(), "", false, HybridFusion::Rrf, 40);
    let hits = store
        .search(
            &[0.1, 0.2, 0.3],
            SourceType::CaseLaw,
            10,
            &ScopeContext::global("t1"),
        )
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert!((hits[0].score - 0.87).abs() < 1e-6);
    assert_eq!(hits[0].chunk.doc_id, "resp-1");
    assert_eq!(hits[0].chunk.position, 3);
}

#[tokio::test]
async fn neo4j_commit_surfaces_query_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "errors": [{"code": "Neo.ClientError", "message": "syntax error"}]
        })))
        .mount(&server)
        .await;

    let store = Neo4jGraphStore::new(server.uri(), "neo4j", "neo4j", "password");
    let result = store.run_query("MATCH (n) RETURN n", json!({})).await;
    match result {
        Err(CoreError::Upstream(message)) => assert!(message.contains("syntax error")),
        other => panic!("expected upstream error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn neo4j_rows_are_keyed_by_column() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "columns": ["score", "description", "entities"],
                "data": [{"row": [4.0, "sinal", []]}]
            }],
            "errors": []
        })))
        .mount(&server)
        .await;

    let store = Neo4jGraphStore::new(server.uri(), "neo4j", "neo4j", "password");
    let rows = store.run_query("RETURN 1", json!({})).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["score"], 4.0);
    assert_eq!(rows[0]["description"], "sinal");
}

#[tokio::test]
async fn remote_embedder_caches_repeat_inputs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"embedding": [0.25, 0.5, 0.75]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let embedder = RemoteEmbedder::new(
        server.uri(),
        "key",
        "test-model",
        3,
        16,
        std::time::Duration::from_secs(60),
    );

    let first = embedder.embed("mesma consulta").await.unwrap();
    let second = embedder.embed("mesma consulta").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(embedder.cache_stats().hits, 1);
}
