use plugin_obsidian::ObsidianPlugin;
use reorg_plugin::runtime::serve;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    serve(ObsidianPlugin::default()).await
}
