//! End-to-end page sessions over the in-memory transport

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use panelstream::config::Config;
use panelstream::domain::{PanelId, PanelKey, SubgroupId};
use panelstream::session::{PageSession, PanelUpdate, SessionSummary};
use panelstream::transport::MemoryTransport;

const PAGE: &str = r#"
streaming:
  root-url: http://memory/data-stream/
panels:
  - name: concordance
    requests:
      - url: http://backend/conc
        method: POST
        body:
          q: house
  - name: collocations
    read-subq-from: [concordance]
    requests:
      - url: http://backend/colls
        method: POST
        body:
          corpus: syn2020
  - name: notes
    type: EmptyTile
"#;

fn key(p: u32) -> PanelKey {
    PanelKey::single(PanelId(p))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<PanelUpdate>) -> Vec<PanelUpdate> {
    let mut out = Vec::new();
    while let Ok(update) = rx.try_recv() {
        out.push(update);
    }
    out
}

// =============================================================================
// Dependent panels
// =============================================================================

#[tokio::test]
async fn test_dependent_panel_receives_subqueries() {
    let config: Config = serde_yaml::from_str(PAGE).expect("Failed to parse page");
    let transport = MemoryTransport::new();
    let (session, coordinator) =
        PageSession::launch(&config, Arc::new(transport.clone())).expect("Failed to launch session");
    let registry = session.registry().clone();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = tokio::spawn(session.run(tx));

    // main round: the concordance and the empty notes panel
    let main = transport.next_submission().await.expect("main batch");
    let tiles: Vec<u32> = main.body.requests.iter().map(|r| r.panel.value()).collect();
    assert_eq!(tiles, vec![0, 2]);
    assert!(main.body.requests[1].is_opt_out());
    main.channel.send_data(key(0), r#"{"size": 42}"#);
    main.channel.close();

    // the collocations panel starts in its own subgroup once the concordance finished
    let sub = transport.next_submission().await.expect("subgroup batch");
    assert_eq!(sub.endpoint.as_str(), "http://memory/data-stream/sg-1");
    assert_eq!(sub.body.requests.len(), 1);
    let body: Value = serde_json::from_str(&sub.body.requests[0].body).expect("JSON body");
    assert_eq!(body["corpus"], "syn2020");
    assert_eq!(body["subqueries"], json!([{"size": 42}]));

    sub.channel.send_data(key(1), r#"{"items": []}"#);
    sub.channel.close();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("session timed out")
        .expect("session task panicked")
        .expect("session failed");
    assert_eq!(summary, SessionSummary { finished: 3, failed: 0 });

    let updates = drain(&mut rx);
    assert!(updates.contains(&PanelUpdate::Activated {
        panel: PanelId(1),
        group: SubgroupId(1)
    }));
    assert!(updates.contains(&PanelUpdate::Activated {
        panel: PanelId(2),
        group: SubgroupId::MAIN
    }));
    let data: Vec<PanelKey> = updates
        .iter()
        .filter_map(|u| match u {
            PanelUpdate::Data { key, .. } => Some(*key),
            _ => None,
        })
        .collect();
    assert_eq!(data, vec![key(0), key(1)]);

    registry.shutdown().await.expect("Failed to shutdown");
    coordinator.await.expect("coordinator panicked");
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_failed_batch_still_unblocks_dependents() {
    let config: Config = serde_yaml::from_str(PAGE).expect("Failed to parse page");
    let transport = MemoryTransport::new();
    transport.fail_next_submit(500, "Internal Server Error").await;
    let (session, _coordinator) =
        PageSession::launch(&config, Arc::new(transport.clone())).expect("Failed to launch session");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = tokio::spawn(session.run(tx));

    // the concordance failed without data, so collocations goes out without subqueries
    let sub = transport.next_submission().await.expect("subgroup batch");
    let body: Value = serde_json::from_str(&sub.body.requests[0].body).expect("JSON body");
    assert!(body.get("subqueries").is_none());
    sub.channel.send_data(key(1), r#"{"items": [1]}"#);
    sub.channel.close();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("session timed out")
        .expect("session task panicked")
        .expect("session failed");
    assert_eq!(summary, SessionSummary { finished: 3, failed: 1 });
    assert_eq!(transport.attempts(), 2);

    let failed: Vec<PanelKey> = drain(&mut rx)
        .into_iter()
        .filter_map(|u| match u {
            PanelUpdate::Failed { key, .. } => Some(key),
            _ => None,
        })
        .collect();
    // the notes panel opted out, so only the concordance reports the failure
    assert_eq!(failed, vec![key(0)]);
}
