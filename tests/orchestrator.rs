//! End-to-end pipeline tests against canned responses.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use channelkit::auth::{AuthGate, Authenticator, Credential, Session};
use channelkit::error::{Error, ProcessorStage};
use channelkit::fetch::MemoryFetcher;
use channelkit::node::{ContentNode, NodeSnapshot};
use channelkit::orchestrator::{LeafOutcome, Orchestrator};
use channelkit::parser::{MatchType, ParserDefinition, ParserRegistry, PathStep};
use channelkit::stream::{AdaptiveBridge, DeclaredEngine, HlsOptions, ResolveRequest, Transport};

const SHOW_URL: &str = "https://tv.example/shows/news";
const MASTER_URL: &str = "https://cdn.example/news/ep1/master.m3u8?tok=abc";

const SHOW_PAGE: &str = r#"{
  "seasons": [{"title": "Season 1", "url": "https://tv.example/shows/news/s1"}],
  "episodes": [
    {"title": "Episode 1", "url": "https://tv.example/video/1"},
    {"title": "Episode 2"},
    {"title": "Episode 3", "url": "https://tv.example/video/3"}
  ]
}"#;

const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1204000
c2.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=90000,URI=\"iframe.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=2504000
c1.m3u8?null=
";

fn show_definitions() -> Vec<ParserDefinition> {
    vec![
        ParserDefinition::new("seasons", "/shows/", MatchType::Contains)
            .with_json_items(vec![PathStep::key("seasons")])
            .with_creator(|_, row| {
                Ok(row
                    .str("url")
                    .map(|url| ContentNode::folder(row.str("title").unwrap_or_default(), url)))
            }),
        ParserDefinition::new("episodes", "/shows/", MatchType::Contains)
            .with_json_items(vec![PathStep::key("episodes")])
            .with_creator(|parent, row| {
                let Some(url) = row.str("url") else {
                    anyhow::bail!("episode without url");
                };
                Ok(Some(
                    ContentNode::leaf(row.str("title").unwrap_or_default(), url)
                        .with_metadata("show", parent.name.clone()),
                ))
            }),
    ]
}

fn video_definition() -> ParserDefinition {
    ParserDefinition::new("video", "/video/", MatchType::Contains).with_updater(|ctx, mut node| {
        Box::pin(async move {
            if node.url.ends_with("/3") {
                return anyhow::Ok(node);
            }
            let request = ResolveRequest::new(MASTER_URL)
                .with_hls(HlsOptions::default().with_query_string(true))
                .drm_required(node.is_drm_protected);
            let streams = ctx.resolve_streams(request).await?;
            node.add_streams(streams);
            anyhow::Ok(node)
        })
    })
}

fn orchestrator(defs: Vec<ParserDefinition>, fetcher: MemoryFetcher) -> Orchestrator {
    let mut registry = ParserRegistry::new();
    for def in defs {
        registry.register(def).expect("valid definition");
    }
    Orchestrator::new(registry, Arc::new(fetcher))
}

fn fetcher() -> MemoryFetcher {
    MemoryFetcher::new()
        .with_response(SHOW_URL, 200, SHOW_PAGE)
        .with_response(MASTER_URL, 200, MASTER)
}

#[tokio::test]
async fn chained_definitions_share_one_fetch() {
    let fetcher = Arc::new(fetcher());
    let mut registry = ParserRegistry::new();
    for def in show_definitions() {
        registry.register(def).unwrap();
    }
    let orch = Orchestrator::new(registry, fetcher.clone());

    let mut show = ContentNode::folder("News", SHOW_URL);
    let failures = orch.expand_into(&mut show).await.unwrap();

    let names: Vec<&str> = show.children().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Season 1", "Episode 1", "Episode 3"]);
    assert!(show.is_complete());
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].parser, "episodes");
    assert_eq!(failures[0].index, 1);
    assert!(failures[0].reason.contains("episode without url"));

    assert_eq!(show.children()[1].metadata_str("show"), Some("News"));
    assert_eq!(fetcher.fetch_log(), vec![SHOW_URL]);
}

#[tokio::test]
async fn preprocessor_nodes_lead_and_postprocessor_sees_everything() {
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_post = seen.clone();

    let def = ParserDefinition::new("episodes", SHOW_URL, MatchType::Exact)
        .with_json_items(vec![PathStep::key("episodes")])
        .with_preprocessor(|payload| {
            Ok((payload.to_string(), vec![ContentNode::folder("Extras", "https://tv.example/extras")]))
        })
        .with_creator(|_, row| Ok(row.str("url").map(|url| ContentNode::leaf(row.str("title").unwrap_or_default(), url))))
        .with_postprocessor(move |_, mut nodes| {
            seen_in_post.store(nodes.len(), Ordering::SeqCst);
            nodes.retain(|n| n.name != "Episode 3");
            Ok(nodes)
        });

    let orch = orchestrator(vec![def], fetcher());
    let children = orch.expand(&ContentNode::folder("News", SHOW_URL)).await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 3);
    let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Extras", "Episode 1"]);
    assert!(children.iter().all(|c| c.parent().is_some_and(|p| p.url == SHOW_URL)));
}

#[tokio::test]
async fn processor_errors_are_fatal() {
    let def = ParserDefinition::new("broken", SHOW_URL, MatchType::Exact)
        .with_postprocessor(|_, _| anyhow::bail!("layout changed"));
    let orch = orchestrator(vec![def], fetcher());

    let err = orch.expand(&ContentNode::folder("News", SHOW_URL)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ProcessorFailed {
            stage: ProcessorStage::Postprocessor,
            ..
        }
    ));
}

#[tokio::test]
async fn malformed_json_is_fatal() {
    let fetcher = MemoryFetcher::new().with_response(SHOW_URL, 200, "<html>maintenance</html>");
    let orch = orchestrator(show_definitions(), fetcher);
    let err = orch.expand(&ContentNode::folder("News", SHOW_URL)).await.unwrap_err();
    assert!(matches!(err, Error::MalformedPayload { .. }));
}

#[tokio::test]
async fn unmatched_url_has_no_parser() {
    let orch = orchestrator(show_definitions(), fetcher());
    let err = orch
        .expand(&ContentNode::folder("Elsewhere", "https://other.example/"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoParserFound { .. }));
}

#[tokio::test]
async fn leaf_completion_expands_manifest() {
    let orch = orchestrator(vec![video_definition()], fetcher());

    let leaf = orch.complete(ContentNode::leaf("Episode 1", "https://tv.example/video/1")).await.unwrap();
    assert!(leaf.is_complete());

    let streams: Vec<(&str, u32)> = leaf.streams().iter().map(|s| (s.url.as_str(), s.bitrate_kbps)).collect();
    assert_eq!(
        streams,
        vec![
            ("https://cdn.example/news/ep1/c1.m3u8?tok=abc", 2504),
            ("https://cdn.example/news/ep1/c2.m3u8?tok=abc", 1204),
        ]
    );
    assert!(leaf.streams().iter().all(|s| s.transport == Transport::Hls));
}

#[tokio::test]
async fn drm_leaf_without_engine_fails() {
    let orch = orchestrator(vec![video_definition()], fetcher());
    let leaf = ContentNode::leaf("Episode 1", "https://tv.example/video/1").with_drm(true);
    let err = orch.complete(leaf).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedDrm { .. }));
}

#[tokio::test]
async fn drm_leaf_with_engine_goes_native() {
    let engine = Arc::new(DeclaredEngine::new("inputstream.adaptive", true, true, true));
    let orch = orchestrator(vec![video_definition()], fetcher()).with_bridge(AdaptiveBridge::new(Some(engine)));

    let leaf = ContentNode::leaf("Episode 1", "https://tv.example/video/1").with_drm(true);
    let leaf = orch.complete(leaf).await.unwrap();
    assert!(leaf.is_complete());
    assert_eq!(leaf.streams().len(), 1);
    assert_eq!(
        leaf.streams()[0].adaptive.as_ref().map(|a| a.engine.as_str()),
        Some("inputstream.adaptive")
    );
}

#[tokio::test]
async fn complete_all_keeps_input_order() {
    let orch = orchestrator(vec![video_definition()], fetcher()).with_workers(2);
    let leaves = vec![
        ContentNode::leaf("Episode 1", "https://tv.example/video/1"),
        ContentNode::leaf("Episode 3", "https://tv.example/video/3"),
        ContentNode::leaf("Unknown", "https://other.example/x"),
    ];

    let outcomes = orch.complete_all(leaves, &CancellationToken::new()).await;
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(&outcomes[0], LeafOutcome::Completed(n) if n.is_complete()));
    // no streams: returned, but not complete
    assert!(matches!(&outcomes[1], LeafOutcome::Completed(n) if !n.is_complete()));
    assert!(matches!(&outcomes[2], LeafOutcome::Failed { error: Error::NoParserFound { .. }, .. }));
    assert_eq!(outcomes[2].node().name, "Unknown");
}

#[tokio::test]
async fn cancelled_batch_returns_nodes_untouched() {
    let orch = orchestrator(vec![video_definition()], fetcher());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let leaves = vec![
        ContentNode::leaf("Episode 1", "https://tv.example/video/1"),
        ContentNode::leaf("Episode 1 again", "https://tv.example/video/1"),
    ];
    let outcomes = orch.complete_all(leaves, &cancel).await;
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, LeafOutcome::Cancelled(n) if !n.is_complete() && n.streams().is_empty())));
}

#[derive(Default)]
struct TestAuthenticator {
    logged_on: AtomicBool,
    attempts: AtomicUsize,
}

#[async_trait]
impl Authenticator for TestAuthenticator {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn log_on(&self, _credential: &Credential) -> anyhow::Result<Session> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.logged_on.store(true, Ordering::SeqCst);
        Ok(Session {
            token: "session".to_string(),
            expiry: None,
        })
    }

    async fn is_authenticated(&self) -> bool {
        self.logged_on.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn logon_runs_once_before_protected_pages() {
    let auth = Arc::new(TestAuthenticator::default());
    let gate = Arc::new(AuthGate::new(auth.clone(), Some(Credential::new("viewer", "secret"))));
    let defs = vec![video_definition().requires_logon(true)];
    let orch = orchestrator(defs, fetcher()).with_auth(gate);

    let leaves = (0..4)
        .map(|i| ContentNode::leaf(format!("Episode {i}"), "https://tv.example/video/1"))
        .collect();
    let outcomes = orch.complete_all(leaves, &CancellationToken::new()).await;

    assert!(outcomes.iter().all(|o| matches!(o, LeafOutcome::Completed(n) if n.is_complete())));
    assert_eq!(auth.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expanded_tree_survives_snapshot() {
    let orch = orchestrator(show_definitions(), fetcher());
    let mut show = ContentNode::folder("News", SHOW_URL);
    orch.expand_into(&mut show).await.unwrap();

    let json = NodeSnapshot::new(show.clone()).to_json().unwrap();
    let restored = NodeSnapshot::from_json(&json).unwrap();
    assert_eq!(restored.children().len(), show.children().len());
    assert_eq!(restored.children()[2].parent().map(|p| p.name.as_str()), Some("News"));
}

#[test]
fn exact_rule_wins_over_contains_and_end() {
    let mut registry = ParserRegistry::new();
    registry
        .register(ParserDefinition::new("news", "/news", MatchType::Contains))
        .unwrap();
    registry
        .register(ParserDefinition::new("json", ".json", MatchType::End))
        .unwrap();
    registry
        .register(ParserDefinition::new("today", "/news/today.json", MatchType::Exact))
        .unwrap();

    assert_eq!(registry.resolve("/news/today.json").unwrap().label(), "today");
    assert_eq!(registry.resolve("/news/yesterday.json").unwrap().label(), "news");
    assert_eq!(registry.resolve("/sport/today.json").unwrap().label(), "json");
}

#[tokio::test]
async fn filtering_out_every_child_leaves_folder_incomplete() {
    let orch = orchestrator(show_definitions(), fetcher());
    let mut show = ContentNode::folder("News", SHOW_URL);
    orch.expand_into(&mut show).await.unwrap();
    assert!(show.is_complete());

    show.retain_children(|child| child.is_folder());
    assert_eq!(show.children().len(), 1);
    assert!(show.is_complete());

    show.retain_children(|_| false);
    assert!(!show.is_complete());
}

#[test]
fn decoding_a_node_cannot_forge_completeness() {
    let forged = r#"{"id":"v","name":"Episode","url":"https://tv.example/video/9","complete":true,"kind":"leaf","streams":[]}"#;
    let node: ContentNode = serde_json::from_str(forged).unwrap();
    assert!(node.is_leaf());
    assert!(!node.is_complete());
}
