//! Leader Election Tests
//!
//! Several processes of one wallet on a shared bus.

mod helpers;

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use helpers::*;
use tw_core::{
	config::CoordinatorConfig,
	infra::{event::EventBus, store::MemoryStore},
	service::{leader::LocalBus, sync::SyncContext, LeaderCoordinator, Service},
};

fn processes(bus: &LocalBus, count: usize) -> Vec<LeaderCoordinator> {
	(0..count)
		.map(|_| {
			LeaderCoordinator::new(
				CoordinatorConfig::default(),
				Arc::new(bus.clone()),
				EventBus::default(),
			)
		})
		.collect()
}

fn leaders(processes: &[&LeaderCoordinator]) -> usize {
	processes.iter().filter(|c| c.is_leader()).count()
}

#[tokio::test(start_paused = true)]
async fn test_single_leader_among_processes() -> anyhow::Result<()> {
	let bus = LocalBus::new(256);
	let coordinators = processes(&bus, 4);

	for result in join_all(coordinators.iter().map(|c| c.start())).await {
		result?;
	}
	tokio::time::sleep(Duration::from_secs(5)).await;

	let all = coordinators.iter().collect::<Vec<_>>();
	assert_eq!(leaders(&all), 1);

	let highest = coordinators
		.iter()
		.map(LeaderCoordinator::instance_id)
		.max();
	for c in &coordinators {
		assert_eq!(c.leader_id(), highest);
	}

	// heartbeats keep the same leader in place
	tokio::time::sleep(Duration::from_secs(60)).await;
	assert_eq!(leaders(&all), 1);
	for c in &coordinators {
		assert_eq!(c.leader_id(), highest);
	}

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_follower_takes_over_after_leader_stops() -> anyhow::Result<()> {
	let bus = LocalBus::new(256);
	let coordinators = processes(&bus, 3);

	for c in &coordinators {
		c.start().await?;
	}
	tokio::time::sleep(Duration::from_secs(5)).await;

	let (leader, rest): (Vec<_>, Vec<_>) = coordinators.iter().partition(|c| c.is_leader());
	assert_eq!(leader.len(), 1);
	leader[0].stop().await?;

	tokio::time::sleep(Duration::from_secs(20)).await;

	assert_eq!(leaders(&rest), 1);
	let successor = rest.iter().map(|c| c.instance_id()).max();
	for c in &rest {
		assert_eq!(c.leader_id(), successor);
	}

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_only_leader_holds_sync_lock() -> anyhow::Result<()> {
	let bus = LocalBus::new(256);
	let coordinators = processes(&bus, 2);
	for c in &coordinators {
		c.start().await?;
	}
	tokio::time::sleep(Duration::from_secs(5)).await;

	let (leader, follower): (Vec<_>, Vec<_>) = coordinators.iter().partition(|c| c.is_leader());

	assert!(leader[0].acquire_lock(Duration::from_secs(1)).await);
	assert!(!follower[0].acquire_lock(Duration::from_secs(2)).await);

	leader[0].release_lock();
	assert!(leader[0].acquire_lock(Duration::from_secs(1)).await);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_follower_process_skips_remote_publish() -> anyhow::Result<()> {
	let world = World::new();
	let store = Arc::new(MemoryStore::new());
	let first = world.wallet_on(store.clone());
	let second = world.wallet_on(store);
	start(&first).await?;
	start(&second).await?;
	tokio::time::sleep(Duration::from_secs(3)).await;

	let (leader, follower) = if first.coordinator().is_leader() {
		(&first, &second)
	} else {
		(&second, &first)
	};
	assert!(!follower.coordinator().is_leader());

	// both processes see the same local inventory
	leader.inventory().put_token(&token("alpha", 100))?;
	assert_eq!(follower.inventory().active_count()?, 1);

	let report = follower.sync(&SyncContext::normal()).await?;
	assert!(report.publish_skipped);
	assert_eq!(world.remote.publish_count(), 0);

	let report = leader.sync(&SyncContext::normal()).await?;
	assert!(report.published);
	assert_eq!(world.remote.publish_count(), 1);

	Ok(())
}
