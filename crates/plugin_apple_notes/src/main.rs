use plugin_apple_notes::AppleNotesPlugin;
use reorg_plugin::runtime::serve;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    serve(AppleNotesPlugin::default()).await
}
