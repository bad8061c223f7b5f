use std::sync::Arc;

use crossbeam_queue::SegQueue;
use renderer::{PrepareError, PrepareOptions, WorkerStagedResult, prepare_off_owner_thread};
use tiles::{TileId, TileLoadResult, TransformMatrix4x4};
use tracing::trace;

/// A completed worker phase waiting for owner-thread finalization.
#[derive(Debug)]
pub struct StagedTile {
    pub tile: TileId,
    pub result: Result<WorkerStagedResult, PrepareError>,
}

/// Worker-side handle. Cloned freely into worker pools; every clone feeds the
/// same owner-thread queue.
#[derive(Debug, Clone)]
pub struct StagingSender {
    queue: Arc<SegQueue<StagedTile>>,
    options: PrepareOptions,
}

impl StagingSender {
    pub fn options(&self) -> PrepareOptions {
        self.options
    }

    /// Run the worker phase to completion on the calling thread.
    pub fn stage_blocking(
        &self,
        tile: TileId,
        load_result: TileLoadResult,
        transform: TransformMatrix4x4,
    ) {
        let result =
            pollster::block_on(prepare_off_owner_thread(load_result, transform, self.options));
        self.push(tile, result);
    }

    pub async fn stage(
        &self,
        tile: TileId,
        load_result: TileLoadResult,
        transform: TransformMatrix4x4,
    ) {
        let result = prepare_off_owner_thread(load_result, transform, self.options).await;
        self.push(tile, result);
    }

    /// Hand over a result produced elsewhere.
    pub fn push(&self, tile: TileId, result: Result<WorkerStagedResult, PrepareError>) {
        trace!(?tile, ok = result.is_ok(), "staged tile queued for finalization");
        self.queue.push(StagedTile { tile, result });
    }
}

/// Owner-thread end of the staging hand-off.
#[derive(Debug)]
pub struct StagingQueue {
    queue: Arc<SegQueue<StagedTile>>,
    options: PrepareOptions,
}

impl StagingQueue {
    pub fn new(options: PrepareOptions) -> Self {
        Self {
            queue: Arc::new(SegQueue::new()),
            options,
        }
    }

    pub fn sender(&self) -> StagingSender {
        StagingSender {
            queue: self.queue.clone(),
            options: self.options,
        }
    }

    pub fn pop(&self) -> Option<StagedTile> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tiles::{IDENTITY_TRANSFORM, MeshContent, MeshPrimitive, TileArena, TileContent};

    use super::*;

    fn triangle() -> TileLoadResult {
        TileLoadResult::new(TileContent::Mesh(MeshContent {
            primitives: vec![MeshPrimitive {
                positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                indices: vec![0, 1, 2],
                ..MeshPrimitive::default()
            }],
        }))
    }

    #[test]
    fn worker_threads_feed_one_queue() {
        let mut arena = TileArena::<()>::new();
        let tiles: Vec<TileId> = (0..8).map(|i| arena.insert(format!("tile-{i}"))).collect();
        let queue = StagingQueue::new(PrepareOptions::default());

        let handles: Vec<_> = tiles
            .iter()
            .map(|tile| {
                let sender = queue.sender();
                let tile = *tile;
                thread::spawn(move || sender.stage_blocking(tile, triangle(), IDENTITY_TRANSFORM))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), tiles.len());
        let mut seen = Vec::new();
        while let Some(staged) = queue.pop() {
            let result = staged.result.unwrap();
            assert!(result.staged.is_some());
            seen.push(staged.tile);
        }
        seen.sort();
        let mut expected = tiles.clone();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(queue.is_empty());
    }

    #[test]
    fn async_stage_reports_malformed_content() {
        let mut arena = TileArena::<()>::new();
        let tile = arena.insert("broken");
        let queue = StagingQueue::new(PrepareOptions::default());
        let broken = TileLoadResult::new(TileContent::Mesh(MeshContent {
            primitives: vec![MeshPrimitive {
                positions: vec![[0.0, 0.0, 0.0]],
                indices: vec![0, 0, 7],
                ..MeshPrimitive::default()
            }],
        }));

        pollster::block_on(queue.sender().stage(tile, broken, IDENTITY_TRANSFORM));

        let staged = queue.pop().unwrap();
        assert_eq!(staged.tile, tile);
        assert!(matches!(
            staged.result,
            Err(PrepareError::IndexOutOfRange { index: 7, .. })
        ));
    }
}
