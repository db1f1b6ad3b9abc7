#[tokio::main]
async fn main() -> devconf_controller::Result<()> {
    devconf_controller::init_tracing();
    let mode = devconf_controller::parse_command()?;
    tracing::info!(
        version = devconf_controller::version::VERSION,
        git_sha = devconf_controller::version::GIT_SHA,
        built_at = devconf_controller::version::BUILD_TIMESTAMP,
        mode = ?mode,
        "devconf-controller starting"
    );
    devconf_controller::run(mode).await
}
