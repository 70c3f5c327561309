mod action;
mod config;
mod controller;
mod correlator;
mod error;
mod events;
mod host;
mod lease;
mod mdns;
mod publisher;
mod update;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::controller::{Controller, ControllerEvent, ControllerEventKind};
use crate::correlator::ResponseCorrelator;
use crate::host::{HostAddressController, HostAddresses};
use crate::lease::{LeaseHandle, LeaseScheduler};
use crate::mdns::browser::{DiscoveryEvent, DiscoveryEventKind, DiscoveryFeed};
use crate::publisher::ServicePublisher;
use crate::update::dns::DnsUpdateTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sd_publishd=info"))
        )
        .init();

    tracing::info!("Starting sd-publishd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/sd-publishd/sd-publishd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let cancel = CancellationToken::new();

    // Responses are matched on their own task; the transport only sends
    let (correlator, responses) = ResponseCorrelator::new();
    let settle = correlator.settle_handle();
    let correlator_handle = tokio::spawn(correlator.run(cancel.clone()));

    let (transport, socket_handle) = DnsUpdateTransport::connect(
        &config.dns,
        &config.publisher.zone,
        responses,
        cancel.clone(),
    )
    .await?;

    let settings = Arc::new(config.publisher.clone());
    let publisher = ServicePublisher::new(Arc::new(transport), settings.clone());

    let (leases, lease_inbox) = LeaseHandle::channel();
    let (mut controller, actions) = Controller::new(publisher.clone(), leases.clone());
    controller.events_mut().subscribe(ControllerEventKind::Quit, |_: &ControllerEvent| {
        tracing::info!("Controller drained, all services withdrawn");
    });
    let mut scheduler = LeaseScheduler::new(publisher.clone(), lease_inbox, controller.membership());

    let host = if config.host.publish {
        let addresses = HostAddresses::detect(&config.host, settings.target());
        scheduler = scheduler.with_host(addresses.clone());
        Some(HostAddressController::new(addresses, publisher.clone(), leases))
    } else {
        None
    };

    let controller_handle = tokio::spawn(controller.run());
    let lease_cancel = cancel.child_token();
    let scheduler_handle = tokio::spawn(scheduler.run(lease_cancel.clone()));

    if let Some(host) = &host {
        host.publish();
    }

    for record in &config.services {
        tracing::info!("Publishing static service {}", record);
        actions.add(record.clone())?;
    }

    // Mirror the local link into the zone
    let feed_cancel = cancel.child_token();
    let mut mdns_daemon = None;
    let mut feed_handle = None;
    if config.mdns.enabled {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        let local_host = config.mdns.local_only.then(|| settings.hostname.clone());
        let mut feed = DiscoveryFeed::new(daemon.clone(), local_host);

        let added = actions.clone();
        feed.events_mut().subscribe(DiscoveryEventKind::Added, move |event: &DiscoveryEvent| {
            if let DiscoveryEvent::Added(record) = event {
                if let Err(e) = added.add(record.clone()) {
                    tracing::warn!("Dropping discovered {}: {}", record, e);
                }
            }
        });
        let removed = actions.clone();
        feed.events_mut().subscribe(DiscoveryEventKind::Removed, move |event: &DiscoveryEvent| {
            if let DiscoveryEvent::Removed(record) = event {
                if let Err(e) = removed.delete(record.clone()) {
                    tracing::warn!("Dropping removal of {}: {}", record, e);
                }
            }
        });
        feed.events_mut().subscribe(DiscoveryEventKind::Quit, |_: &DiscoveryEvent| {
            tracing::info!("Discovery feed stopped");
        });

        let cancel = feed_cancel.clone();
        feed_handle = Some(tokio::spawn(async move {
            if let Err(e) = feed.run(cancel).await {
                tracing::error!("mDNS browser error: {}", e);
            }
        }));
        mdns_daemon = Some(daemon);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    for record in &config.services {
        if let Err(e) = actions.delete(record.clone()) {
            tracing::warn!("Failed to withdraw {}: {}", record, e);
        }
    }

    // Stop discovery before the controller so no Add lands after Quit
    feed_cancel.cancel();
    if let Some(handle) = feed_handle {
        let _ = handle.await;
    }

    // No renewals once withdrawal starts
    lease_cancel.cancel();
    if let Err(e) = scheduler_handle.await {
        tracing::error!("Lease scheduler task failed: {}", e);
    }

    if let Err(e) = actions.quit() {
        tracing::error!("Failed to stop controller: {}", e);
    }
    match controller_handle.await {
        Ok(registry) => tracing::info!("Controller stopped with {} services", registry.size()),
        Err(e) => tracing::error!("Controller task failed: {}", e),
    }

    if let Some(host) = &host {
        host.unpublish();
    }

    let grace = settings.max_dns_response_time();
    match tokio::time::timeout(grace, settle.settled()).await {
        Ok(true) => tracing::info!("All updates answered"),
        Ok(false) => tracing::warn!("Response correlator stopped early"),
        Err(_) => tracing::warn!("Gave up waiting for responses after {:?}", grace),
    }

    cancel.cancel();
    let _ = tokio::join!(socket_handle, correlator_handle);

    if let Some(daemon) = mdns_daemon {
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
