mod command;
mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleet_shared::codec::Frame;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use command::{CommandHandler, StatusPublisher};
use session::{Session, SessionManager};

/// Simulated regional execution endpoint
#[derive(Parser)]
#[command(name = "endpoint-sim", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SIM_LISTEN", default_value = "127.0.0.1:7400")]
    listen: String,

    /// Reject every Nth command (0 accepts everything)
    #[arg(long, default_value = "0")]
    reject_every: u64,

    /// Re-publish last known status this often
    #[arg(long, default_value = "5000")]
    republish_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let sessions = Arc::new(SessionManager::new());
    let handler = Arc::new(CommandHandler::new(sessions.clone(), args.reject_every));

    let publisher = StatusPublisher::new(
        handler.clone(),
        sessions.clone(),
        Duration::from_millis(args.republish_ms.max(1)),
    );
    tokio::spawn(async move { publisher.run().await });

    let listener = TcpListener::bind(&args.listen).await?;
    info!("Endpoint simulator listening on {}", args.listen);
    if args.reject_every > 0 {
        info!("Rejecting every {} commands", args.reject_every);
    }

    let next_session = AtomicU64::new(1);
    loop {
        let (socket, addr) = listener.accept().await?;
        let session_id = next_session.fetch_add(1, Ordering::SeqCst);
        debug!("Connection {} from {}", session_id, addr);

        let sessions = sessions.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            serve(socket, addr, session_id, sessions, handler).await;
        });
    }
}

/// Serve one client until it disconnects
async fn serve(
    socket: TcpStream,
    addr: SocketAddr,
    session_id: u64,
    sessions: Arc<SessionManager>,
    handler: Arc<CommandHandler>,
) {
    let mut session = Session::new(socket, addr, session_id);
    let handle = session.handle();

    while let Some(frame) = session.recv().await {
        let reply = match frame {
            Frame::Send { request, endpoint } => Some(handler.handle_send(&request, &endpoint).await),
            Frame::QueryStatus { device_id, endpoint } => {
                Some(handler.handle_query(&device_id, &endpoint).await)
            }
            Frame::Subscribe { device_id } => {
                sessions.subscribe(&device_id, handle.clone()).await;
                info!(device_id = %device_id, "Status feed opened by {}", session.addr());

                if let Err(e) = handle
                    .send(&Frame::Subscribed {
                        device_id: device_id.clone(),
                    })
                    .await
                {
                    warn!("Write to {} failed: {}", addr, e);
                    break;
                }

                // Bring the new subscriber up to date
                if let Some(status) = handler.last_status(&device_id).await {
                    sessions.publish(&device_id, status).await;
                }
                None
            }
            Frame::Unsubscribe { device_id } => {
                if sessions.unsubscribe(&device_id).await {
                    info!(device_id = %device_id, "Status feed closed");
                }
                None
            }
            other => {
                warn!("Unexpected frame from {}: {:?}", addr, other);
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = handle.send(&reply).await {
                warn!("Write to {} failed: {}", addr, e);
                break;
            }
        }
    }

    let dropped = sessions.remove_session(session_id).await;
    debug!("Connection {} closed, {} feeds dropped", session_id, dropped);
}
