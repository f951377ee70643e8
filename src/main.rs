use std::sync::Arc;

use anyhow::Result;

use crewd::config::Settings;
use crewd::core::engine::Engine;
use crewd::core::model::provider::HttpModelProvider;
use crewd::core::research::search::BraveSearch;
use crewd::core::store::SqliteStore;
use crewd::interfaces::web;
use crewd::logging;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let settings = Settings::from_env();

    let store = Arc::new(SqliteStore::open(&settings.store_path)?);
    let provider = Arc::new(HttpModelProvider::new(
        &settings.llm_base_url,
        &settings.llm_api_key,
    ));
    let search = Arc::new(BraveSearch::new(&settings.search_api_key));

    let engine = Engine::with_in_memory_queue(settings, store, provider, search);
    let background = engine.start_background();

    web::serve(engine).await?;

    for handle in background {
        handle.abort();
    }
    Ok(())
}
