//! Integration tests for a full page session.
//!
//! These drive a simulated ChatGPT page through load, streaming, conversation
//! switch and shutdown, with tokio's clock paused so every delay is exact.

use prompt_capture::{
    parse_selector, AppEvent, Config, Document, EventBus, ExtractionOptions, NodeId, PageSession,
    ResultSource,
};
use std::time::Duration;
use tokio::time::sleep;

fn turn(role: &str, text: &str) -> String {
    format!(
        r#"<article data-turn="{role}">
            <div data-message-author-role="{role}"><div class="whitespace-pre-wrap">{text}</div></div>
        </article>"#
    )
}

fn conversation(prompts: &[&str]) -> String {
    prompts
        .iter()
        .map(|p| turn("user", p) + &turn("assistant", &format!("answer to {}", p)))
        .collect()
}

fn chatgpt_page(url: &str, prompts: &[&str]) -> Document {
    Document::parse(
        url,
        &format!(
            r#"<!DOCTYPE html>
            <html><head><title>ChatGPT</title></head>
            <body>
                <nav><a href="/">New chat</a></nav>
                <main id="main"><div class="thread">{}</div></main>
                <div id="ph-sidebar-root"></div>
            </body></html>"#,
            conversation(prompts)
        ),
    )
}

fn find(doc: &Document, selector: &str) -> NodeId {
    let selector = parse_selector(selector).unwrap();
    let page = doc.read();
    page.query(page.root(), &selector).unwrap()
}

fn contents(session: &PageSession) -> Vec<String> {
    session.store().all().into_iter().map(|p| p.content).collect()
}

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.timing.periodic_extraction_ms = 0;
    config
}

#[tokio::test(start_paused = true)]
async fn test_session_lifecycle() {
    let events = EventBus::new();
    let mut updates = events.subscribe();
    let doc = chatgpt_page("https://chatgpt.com/c/abc", &["one", "two", "three"]);

    let session = PageSession::start(quiet_config(), doc.clone(), events.clone())
        .await
        .unwrap();
    assert_eq!(contents(&session), vec!["one", "two", "three"]);

    // A new prompt streams in; the precise watcher picks it up after the debounce.
    doc.append(find(&doc, ".thread"), &turn("user", "four"));
    sleep(Duration::from_millis(700)).await;
    assert_eq!(session.store().len(), 4);

    // Switch conversation: new path, new thread contents.
    doc.set_url("https://chatgpt.com/c/def");
    doc.replace_children(
        find(&doc, ".thread"),
        &conversation(&["a1", "a2", "a3", "a4", "a5"]),
    );
    assert!(doc.detached_len() > 0);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(contents(&session), vec!["a1", "a2", "a3", "a4", "a5"]);
    // The previous conversation's nodes are released at the switch
    assert_eq!(doc.detached_len(), 0);

    assert!(events.history().contains(&AppEvent::UrlChanged {
        from: "/c/abc".into(),
        to: "/c/def".into(),
    }));

    let mut sizes = Vec::new();
    while let Ok(event) = updates.try_recv() {
        if let AppEvent::PromptsUpdated(prompts) = event {
            sizes.push(prompts.len());
        }
    }
    let cleared = sizes.iter().position(|n| *n == 0).unwrap();
    assert_eq!(sizes[..cleared].last(), Some(&4));
    assert_eq!(sizes.last(), Some(&5));

    session.shutdown();
    assert!(session.store().is_empty());
    assert_eq!(doc.observer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_extract_uses_cache() {
    let doc = chatgpt_page("https://chatgpt.com/c/abc", &["only"]);
    let session = PageSession::start(quiet_config(), doc, EventBus::new())
        .await
        .unwrap();

    sleep(Duration::from_secs(1)).await;
    let result = session.extract(ExtractionOptions::default()).await.unwrap();
    assert_eq!(result.source, ResultSource::Cached);
    assert_eq!(result.duration, Duration::ZERO);

    let forced = session.extract(ExtractionOptions::forced()).await.unwrap();
    assert_eq!(forced.source, ResultSource::Fresh);
    session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_page_without_messages_starts_broad() {
    let doc = chatgpt_page("https://chatgpt.com/", &[]);
    let session = PageSession::start(quiet_config(), doc.clone(), EventBus::new())
        .await
        .unwrap();
    assert!(session.store().is_empty());

    doc.append(find(&doc, ".thread"), &turn("user", "hello world"));
    sleep(Duration::from_millis(700)).await;
    assert_eq!(contents(&session), vec!["hello world"]);
    session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_own_ui_does_not_trigger_extraction() {
    let doc = chatgpt_page("https://chatgpt.com/c/abc", &["one"]);
    let events = EventBus::new();
    let session = PageSession::start(quiet_config(), doc.clone(), events.clone())
        .await
        .unwrap();
    events.clear_history();

    doc.append(find(&doc, "#ph-sidebar-root"), "<li>one</li>");
    sleep(Duration::from_secs(1)).await;
    assert!(events.history().is_empty());
    session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_extraction_catches_silent_changes() {
    let doc = chatgpt_page("https://chatgpt.com/c/abc", &["visible"]);
    let session = PageSession::start(Config::default(), doc.clone(), EventBus::new())
        .await
        .unwrap();
    assert_eq!(session.store().len(), 1);

    // Attribute flips are not child-list mutations, so only the periodic pass
    // sees them once the cached result has expired.
    let assistant = find(&doc, r#"article[data-turn="assistant"]"#);
    doc.set_attribute(assistant, "data-turn", "user");

    sleep(Duration::from_secs(8)).await;
    assert_eq!(session.store().len(), 2);
    session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_late_rendered_conversation_is_captured() {
    let doc = chatgpt_page("https://chatgpt.com/c/abc", &["one"]);
    let session = PageSession::start(quiet_config(), doc.clone(), EventBus::new())
        .await
        .unwrap();

    doc.set_url("https://chatgpt.com/c/xyz");
    doc.replace_children(find(&doc, ".thread"), "");
    sleep(Duration::from_millis(2500)).await;
    assert!(session.store().is_empty());

    doc.append(find(&doc, ".thread"), &turn("user", "fresh"));
    sleep(Duration::from_millis(700)).await;
    assert_eq!(contents(&session), vec!["fresh"]);
    session.shutdown();
}
