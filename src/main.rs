use std::{error::Error, future, sync::Arc};

use tokio::{fs, net, signal, sync::watch, task};
use tracing_subscriber::{
    layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use repair_desk::{
    config,
    db::{self, user::Role},
    http::{self, AppState},
    media, Config,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = fs::read_to_string("config.toml").await?;
    let config = toml::from_str::<Config>(&config)?;

    let store = db::open(&config.db).await?;
    if let Some(bootstrap) = &config.bootstrap {
        bootstrap_admin(store.as_ref(), bootstrap).await?;
    }
    let media = Arc::new(media::Dir::open(&config.media).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState::new(store, media, &config, shutdown_rx));
    let scheduler = task::spawn(Arc::clone(&state.scheduler).run());

    let app = http::router(state, &config)?;
    let listener = net::TcpListener::bind(config.http.server.addr).await?;
    tracing::info!(addr = %config.http.server.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    scheduler.await?;
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

/// Creates the configured admin unless a user with that email exists.
async fn bootstrap_admin(
    store: &dyn db::Store,
    bootstrap: &config::Bootstrap,
) -> Result<(), Box<dyn Error>> {
    let email = db::user::normalize_email(&bootstrap.email);
    if store.get_user_by_email(&email).await?.is_some() {
        return Ok(());
    }

    let admin = db::User::new(
        &email,
        &bootstrap.name,
        &bootstrap.password,
        Role::Admin,
    )?;
    store.write_user(&admin).await?;
    tracing::info!(user_id = %admin.id, "bootstrap admin created");
    Ok(())
}
