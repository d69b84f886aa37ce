use anyhow::Result;
use virtuous_shared::LearningPattern;

use super::{print_json, with_spinner};
use crate::client::VirtuousClient;
use crate::output;

pub async fn run(client: &VirtuousClient, component: Option<&str>, json_mode: bool) -> Result<()> {
    let body = with_spinner(json_mode, "Loading patterns...", client.get_learning(component)).await?;
    if json_mode {
        return print_json(&body);
    }

    let mut patterns: Vec<LearningPattern> =
        serde_json::from_value(body["patterns"].clone()).unwrap_or_default();
    patterns.sort_by(|a, b| {
        a.context
            .cmp(&b.context)
            .then(b.confidence.total_cmp(&a.confidence))
    });

    output::print_header("Learned Strategies");
    output::print_patterns_table(&patterns);
    println!();
    Ok(())
}
