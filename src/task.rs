use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A long-running unit of the gateway. Tasks are spawned from `main` and run
/// until completion or until the shared token is cancelled.
#[async_trait]
pub trait Task: Send {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// A request paired with a oneshot channel for the reply.
pub type Command<Req, Res, Err = anyhow::Error> = (Req, oneshot::Sender<Result<Res, Err>>);

pub type ChannelCommandSink<Req, Res, Err = anyhow::Error> = flume::Sender<Command<Req, Res, Err>>;
pub type ChannelCommandSource<Req, Res, Err = anyhow::Error> =
    flume::Receiver<Command<Req, Res, Err>>;

/// Sends a request down a command channel and waits for the reply.
///
/// The outer error is infrastructure (the task is gone); the inner result is
/// the task's own answer.
pub async fn send_command<Req, Res, Err>(
    sink: &ChannelCommandSink<Req, Res, Err>,
    request: Req,
) -> anyhow::Result<Result<Res, Err>> {
    let (ret_tx, ret_rx) = oneshot::channel();

    if sink.send_async((request, ret_tx)).await.is_err() {
        anyhow::bail!("command channel closed");
    }

    ret_rx
        .await
        .map_err(|_| anyhow::anyhow!("command dropped without a reply"))
}
