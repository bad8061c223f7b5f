use std::collections::HashMap;

use protocol::{PrimitiveId, TileOcclusionState};
use thiserror::Error;
use tiles::TileId;
use tracing::{debug, trace};

use crate::OcclusionResults;

/// Renderer hook that creates the invisible primitives standing in for tile
/// bounds in occlusion queries.
pub trait OcclusionProxyFactory {
    fn create_proxy(&mut self) -> PrimitiveId;

    /// Move a proxy onto a tile's bounding volume.
    fn bind_proxy(&mut self, proxy: PrimitiveId, tile: TileId);

    fn destroy_proxy(&mut self, proxy: PrimitiveId);
}

impl<F: OcclusionProxyFactory + ?Sized> OcclusionProxyFactory for Box<F> {
    fn create_proxy(&mut self) -> PrimitiveId {
        (**self).create_proxy()
    }

    fn bind_proxy(&mut self, proxy: PrimitiveId, tile: TileId) {
        (**self).bind_proxy(proxy, tile)
    }

    fn destroy_proxy(&mut self, proxy: PrimitiveId) {
        (**self).destroy_proxy(proxy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProxyPoolError {
    #[error("occlusion proxy slot {index} does not exist")]
    UnknownProxy { index: u32 },
    #[error("occlusion proxy slot {index} is not mapped by this handle")]
    NotMapped { index: u32 },
}

/// Handle to a proxy mapped to one tile. Stale once released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct ProxySlot {
    primitive: PrimitiveId,
    generation: u32,
    tile: Option<TileId>,
    mapped_at: f64,
    state: TileOcclusionState,
}

impl ProxySlot {
    fn reset(&mut self) {
        self.tile = None;
        self.mapped_at = 0.0;
        self.state = TileOcclusionState::Unavailable;
        self.generation = self.generation.wrapping_add(1);
    }
}

pub struct OcclusionProxyPool<F> {
    factory: F,
    slots: Vec<ProxySlot>,
    free: Vec<u32>,
    by_tile: HashMap<TileId, ProxyHandle>,
    capacity: usize,
    /// Generation given to newly created slots. Moves past every generation
    /// handed out before [`OcclusionProxyPool::destroy_all`].
    generation_base: u32,
}

impl<F: OcclusionProxyFactory> OcclusionProxyPool<F> {
    pub fn new(factory: F, capacity: usize) -> Self {
        Self {
            factory,
            slots: Vec::new(),
            free: Vec::new(),
            by_tile: HashMap::new(),
            capacity,
            generation_base: 0,
        }
    }

    /// Map a proxy to `tile`. Records from before `now` are never trusted for
    /// it. Returns `None` when the pool is exhausted.
    pub fn acquire(&mut self, tile: TileId, now: f64) -> Option<ProxyHandle> {
        if let Some(handle) = self.by_tile.get(&tile) {
            return Some(*handle);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                let primitive = self.factory.create_proxy();
                self.slots.push(ProxySlot {
                    primitive,
                    generation: self.generation_base,
                    tile: None,
                    mapped_at: 0.0,
                    state: TileOcclusionState::Unavailable,
                });
                (self.slots.len() - 1) as u32
            }
            None => {
                trace!(capacity = self.capacity, "occlusion proxy pool exhausted");
                return None;
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.tile = Some(tile);
        slot.mapped_at = now;
        self.factory.bind_proxy(slot.primitive, tile);
        let handle = ProxyHandle {
            index,
            generation: slot.generation,
        };
        self.by_tile.insert(tile, handle);
        Some(handle)
    }

    fn slot(&self, handle: ProxyHandle) -> Result<&ProxySlot, ProxyPoolError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(ProxyPoolError::UnknownProxy {
                index: handle.index,
            })?;
        if slot.generation != handle.generation || slot.tile.is_none() {
            return Err(ProxyPoolError::NotMapped {
                index: handle.index,
            });
        }
        Ok(slot)
    }

    pub fn release(&mut self, handle: ProxyHandle) -> Result<(), ProxyPoolError> {
        let tile = self.slot(handle)?.tile;
        if let Some(tile) = tile {
            self.by_tile.remove(&tile);
        }
        self.slots[handle.index as usize].reset();
        self.free.push(handle.index);
        Ok(())
    }

    /// Refresh every mapped proxy. An unavailable answer keeps the previous
    /// state.
    pub fn update_occlusion(&mut self, results: &OcclusionResults) {
        for slot in self.slots.iter_mut().filter(|slot| slot.tile.is_some()) {
            let previously_occluded = slot.state == TileOcclusionState::Occluded;
            let state = results.query_occlusion(slot.primitive, previously_occluded, slot.mapped_at);
            if state != TileOcclusionState::Unavailable {
                slot.state = state;
            }
        }
    }

    pub fn state(&self, handle: ProxyHandle) -> Result<TileOcclusionState, ProxyPoolError> {
        self.slot(handle).map(|slot| slot.state)
    }

    pub fn primitive(&self, handle: ProxyHandle) -> Result<PrimitiveId, ProxyPoolError> {
        self.slot(handle).map(|slot| slot.primitive)
    }

    pub fn state_for_tile(&self, tile: TileId) -> TileOcclusionState {
        self.by_tile
            .get(&tile)
            .and_then(|handle| self.state(*handle).ok())
            .unwrap_or_default()
    }

    pub fn proxy_for_tile(&self, tile: TileId) -> Option<ProxyHandle> {
        self.by_tile.get(&tile).copied()
    }

    pub fn mapped_count(&self) -> usize {
        self.by_tile.len()
    }

    pub fn created_count(&self) -> usize {
        self.slots.len()
    }

    pub fn destroy_all(&mut self) {
        debug!(proxies = self.slots.len(), "destroying occlusion proxies");
        for slot in self.slots.drain(..) {
            self.generation_base = self.generation_base.max(slot.generation.wrapping_add(1));
            self.factory.destroy_proxy(slot.primitive);
        }
        self.free.clear();
        self.by_tile.clear();
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{ResultChannelConfig, create_result_channel};
    use protocol::{OcclusionFrame, OcclusionRecord, RenderFrameNumber, ViewId, ViewOcclusionResults};
    use tiles::TileArena;

    #[derive(Default)]
    struct CountingFactory {
        next: u64,
        bound: Vec<(PrimitiveId, TileId)>,
        destroyed: Vec<PrimitiveId>,
    }

    impl OcclusionProxyFactory for CountingFactory {
        fn create_proxy(&mut self) -> PrimitiveId {
            self.next += 1;
            PrimitiveId(1000 + self.next)
        }

        fn bind_proxy(&mut self, proxy: PrimitiveId, tile: TileId) {
            self.bound.push((proxy, tile));
        }

        fn destroy_proxy(&mut self, proxy: PrimitiveId) {
            self.destroyed.push(proxy);
        }
    }

    fn tiles(count: usize) -> Vec<TileId> {
        let mut arena = TileArena::<()>::new();
        (0..count).map(|index| arena.insert(format!("t{index}"))).collect()
    }

    fn publish(
        producer: &mut engine::OcclusionResultProducer,
        primitive: PrimitiveId,
        time: f64,
        occluded: bool,
    ) {
        let mut frame = OcclusionFrame::new(RenderFrameNumber(time as u64));
        let mut history = producer.acquire_storage();
        history.insert(
            primitive,
            OcclusionRecord {
                primitive_id: primitive,
                last_considered_time: time,
                last_pixels_percentage: if occluded { 0.0 } else { 0.5 },
                occlusion_state_was_definite: true,
                was_occluded: occluded,
            },
        );
        frame.views.push(ViewOcclusionResults {
            view_id: ViewId(0),
            history,
        });
        producer.push(frame);
    }

    #[test]
    fn pool_is_bounded_and_reuses_released_proxies() {
        let tiles = tiles(3);
        let mut pool = OcclusionProxyPool::new(CountingFactory::default(), 2);

        let first = pool.acquire(tiles[0], 0.0).expect("first");
        let _second = pool.acquire(tiles[1], 0.0).expect("second");
        assert_eq!(pool.acquire(tiles[2], 0.0), None);
        assert_eq!(pool.acquire(tiles[0], 5.0), Some(first));

        pool.release(first).expect("release");
        let third = pool.acquire(tiles[2], 1.0).expect("reused slot");
        assert_eq!(pool.created_count(), 2);
        assert_eq!(pool.primitive(third), Ok(PrimitiveId(1001)));
        assert_eq!(pool.factory().bound.len(), 3);
    }

    #[test]
    fn double_release_is_an_error() {
        let tiles = tiles(1);
        let mut pool = OcclusionProxyPool::new(CountingFactory::default(), 1);
        let handle = pool.acquire(tiles[0], 0.0).expect("proxy");

        pool.release(handle).expect("first release");
        assert_eq!(
            pool.release(handle),
            Err(ProxyPoolError::NotMapped { index: 0 })
        );
    }

    #[test]
    fn records_older_than_the_mapping_are_ignored() {
        let tiles = tiles(1);
        let (mut producer, consumer) = create_result_channel(ResultChannelConfig::default());
        let mut results = OcclusionResults::new(consumer, 0.01);
        let mut pool = OcclusionProxyPool::new(CountingFactory::default(), 4);
        let handle = pool.acquire(tiles[0], 10.0).expect("proxy");
        let primitive = pool.primitive(handle).expect("primitive");

        publish(&mut producer, primitive, 9.0, true);
        results.update();
        pool.update_occlusion(&results);
        assert_eq!(pool.state(handle), Ok(TileOcclusionState::Unavailable));

        publish(&mut producer, primitive, 11.0, true);
        results.update();
        pool.update_occlusion(&results);
        assert_eq!(pool.state_for_tile(tiles[0]), TileOcclusionState::Occluded);

        publish(&mut producer, PrimitiveId(1), 12.0, false);
        results.update();
        pool.update_occlusion(&results);
        assert_eq!(
            pool.state(handle),
            Ok(TileOcclusionState::Occluded),
            "unavailable answers keep the previous state"
        );
    }

    #[test]
    fn destroy_all_goes_through_the_factory() {
        let tiles = tiles(2);
        let mut pool = OcclusionProxyPool::new(CountingFactory::default(), 4);
        pool.acquire(tiles[0], 0.0);
        pool.acquire(tiles[1], 0.0);

        pool.destroy_all();

        assert_eq!(pool.factory().destroyed.len(), 2);
        assert_eq!(pool.mapped_count(), 0);
        assert_eq!(pool.state_for_tile(tiles[0]), TileOcclusionState::Unavailable);
    }

    #[test]
    fn handles_from_before_destroy_all_stay_stale() {
        let tiles = tiles(2);
        let mut pool = OcclusionProxyPool::new(CountingFactory::default(), 4);
        let old = pool.acquire(tiles[0], 0.0).expect("proxy");
        pool.release(old).expect("release");
        let reused = pool.acquire(tiles[0], 1.0).expect("proxy");

        pool.destroy_all();
        let new = pool.acquire(tiles[1], 2.0).expect("proxy");

        assert_ne!(new, old);
        assert_ne!(new, reused);
        assert_eq!(pool.state(old), Err(ProxyPoolError::NotMapped { index: 0 }));
        assert_eq!(pool.state(reused), Err(ProxyPoolError::NotMapped { index: 0 }));
        assert_eq!(pool.release(reused), Err(ProxyPoolError::NotMapped { index: 0 }));
        assert_eq!(pool.state(new), Ok(TileOcclusionState::Unavailable));
    }
}
