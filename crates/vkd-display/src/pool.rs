// SPDX-License-Identifier: CEPL-1.0
//! Fixed-size pool of frame images and the two queues they travel through.
//!
//! An image is owned by exactly one place at a time: the available queue, a
//! producer's [`ImageHandle`], the filled queue (as a [`Frame`]), or the
//! display thread while it records and submits. Moving the value between
//! those places is the only way to hand it on.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing::debug;

use crate::description::{copy_rows, FrameSizeMismatch, ImageDescription};
use crate::queue::ConcurrentQueue;

/// A reusable image the pool hands out to producers.
pub trait PoolImage: Send + 'static {
    type Error;

    /// Stable index in `[0, capacity)`; keys per-slot resources.
    fn pool_index(&self) -> usize;

    /// Current backing layout, `None` before the first `create`.
    fn description(&self) -> Option<ImageDescription>;

    fn row_pitch(&self) -> usize;

    fn pixels_mut(&mut self) -> &mut [u8];

    /// Blocks until no earlier submission still reads from this image.
    fn wait_until_free(&mut self) -> Result<(), Self::Error>;

    /// (Re)allocates the backing storage for `description`.
    fn create(&mut self, description: ImageDescription) -> Result<(), Self::Error>;
}

/// One-shot work run by the display thread right before upload.
pub type Transform<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Producer-side access to an acquired image.
///
/// Dropping a handle without queueing it gives the image back to the pool.
pub struct ImageHandle<T: PoolImage> {
    image: Option<T>,
    transform: Option<Transform<T>>,
    home: Arc<ConcurrentQueue<T>>,
}

impl<T: PoolImage> ImageHandle<T> {
    fn new(image: T, home: Arc<ConcurrentQueue<T>>) -> Self {
        Self {
            image: Some(image),
            transform: None,
            home,
        }
    }

    /// Attaches work to run on the display thread before the frame is drawn.
    /// Replaces any transform set earlier.
    pub fn set_transform<F>(&mut self, transform: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.transform = Some(Box::new(transform));
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    fn into_frame(mut self) -> Option<Frame<T>> {
        let image = self.image.take()?;
        Some(Frame {
            image,
            transform: self.transform.take(),
        })
    }
}

impl<T: PoolImage> Deref for ImageHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.image {
            Some(image) => image,
            None => unreachable!("image handle emptied before drop"),
        }
    }
}

impl<T: PoolImage> DerefMut for ImageHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.image {
            Some(image) => image,
            None => unreachable!("image handle emptied before drop"),
        }
    }
}

impl<T: PoolImage> Drop for ImageHandle<T> {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            debug!(index = image.pool_index(), "image handle dropped without queueing");
            self.home.push_front(image);
        }
    }
}

/// A filled image waiting for, or being prepared for, display.
pub struct Frame<T: PoolImage> {
    image: T,
    transform: Option<Transform<T>>,
}

impl<T: PoolImage> Frame<T> {
    /// Runs the attached transform, if any. Returns whether one ran.
    pub fn apply_transform(&mut self) -> bool {
        match self.transform.take() {
            Some(transform) => {
                transform(&mut self.image);
                true
            }
            None => false,
        }
    }

    pub fn pool_index(&self) -> usize {
        self.image.pool_index()
    }

    pub fn image(&self) -> &T {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut T {
        &mut self.image
    }

    pub fn into_image(self) -> T {
        self.image
    }
}

enum Filled<T: PoolImage> {
    Frame(Frame<T>),
    Shutdown,
}

impl<T: PoolImage> Filled<T> {
    fn is_frame(&self) -> bool {
        matches!(self, Filled::Frame(_))
    }
}

/// What the display thread should do next.
pub enum NextFrame<T: PoolImage> {
    Frame(Frame<T>),
    /// The window has no area; one pending frame was dropped.
    Discarded,
    /// The window has no area and nothing was pending.
    Idle,
    Shutdown,
}

pub struct ImagePool<T: PoolImage> {
    available: Arc<ConcurrentQueue<T>>,
    filled: ConcurrentQueue<Filled<T>>,
    capacity: usize,
    filled_max: usize,
}

impl<T: PoolImage> ImagePool<T> {
    /// Seeds the available queue with `images`, in order.
    pub fn new(images: Vec<T>) -> Self {
        debug_assert!(!images.is_empty(), "an empty pool can never hand out an image");
        let capacity = images.len();
        let available = ConcurrentQueue::new();
        for image in images {
            available.push_back(image);
        }
        Self {
            available: Arc::new(available),
            filled: ConcurrentQueue::new(),
            capacity,
            filled_max: capacity.div_ceil(2),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Backlog above which `acquire` steals the oldest undisplayed frame.
    pub fn filled_max(&self) -> usize {
        self.filled_max
    }

    pub fn filled_len(&self) -> usize {
        self.filled.len()
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    /// Hands out an image ready for `description`.
    ///
    /// Takes a free image if there is one, otherwise steals the oldest
    /// undisplayed frame when the backlog is over [`filled_max`](Self::filled_max),
    /// otherwise waits for the display thread to give one back. The image's
    /// previous GPU work is waited on before it is returned.
    pub fn acquire(&self, description: ImageDescription) -> Result<ImageHandle<T>, T::Error> {
        let mut image = self.take_free_image();
        if let Err(err) = Self::prepare(&mut image, description) {
            self.available.push_front(image);
            return Err(err);
        }
        Ok(ImageHandle::new(image, Arc::clone(&self.available)))
    }

    fn take_free_image(&self) -> T {
        if let Some(image) = self.available.try_pop() {
            return image;
        }
        if let Some(Filled::Frame(frame)) = self
            .filled
            .try_reclaim_if_over(self.filled_max, Filled::is_frame)
        {
            debug!(index = frame.pool_index(), "stealing undisplayed frame");
            return frame.into_image();
        }
        self.available.pop()
    }

    fn prepare(image: &mut T, description: ImageDescription) -> Result<(), T::Error> {
        image.wait_until_free()?;
        if image.description() != Some(description) {
            debug!(
                index = image.pool_index(),
                width = description.width,
                height = description.height,
                "reallocating image"
            );
            image.create(description)?;
        }
        Ok(())
    }

    pub fn queue(&self, handle: ImageHandle<T>) {
        if let Some(frame) = handle.into_frame() {
            self.filled.push_back(Filled::Frame(frame));
        }
    }

    /// Acquires an image, copies tightly packed `pixels` into it and queues it.
    pub fn copy_and_queue(
        &self,
        pixels: &[u8],
        description: ImageDescription,
    ) -> Result<(), T::Error>
    where
        T::Error: From<FrameSizeMismatch>,
    {
        let expected = description.packed_len();
        if pixels.len() < expected {
            return Err(FrameSizeMismatch {
                expected,
                actual: pixels.len(),
                width: description.width,
                height: description.height,
            }
            .into());
        }

        let mut handle = self.acquire(description)?;
        let pitch = handle.row_pitch();
        copy_rows(handle.pixels_mut(), pitch, pixels, &description)?;
        self.queue(handle);
        Ok(())
    }

    /// Takes the next frame for the display thread.
    ///
    /// With a degenerate window this never blocks: at most one pending frame
    /// is dropped. Otherwise it waits for a frame or for [`shutdown`](Self::shutdown).
    pub fn next_for_display(&self, window_is_degenerate: bool) -> NextFrame<T> {
        let next = if window_is_degenerate {
            match self.filled.try_pop() {
                Some(next) => next,
                None => return NextFrame::Idle,
            }
        } else {
            self.filled.pop()
        };

        match next {
            Filled::Shutdown => {
                // Keep the sentinel so later calls return immediately too.
                self.filled.push_front(Filled::Shutdown);
                NextFrame::Shutdown
            }
            Filled::Frame(frame) if window_is_degenerate => {
                debug!(index = frame.pool_index(), "window minimized, dropping frame");
                self.discard(frame.into_image());
                NextFrame::Discarded
            }
            Filled::Frame(frame) => NextFrame::Frame(frame),
        }
    }

    /// Returns an image that was never submitted; it is reused first.
    pub fn release(&self, image: T) {
        self.available.push_front(image);
    }

    pub fn discard(&self, image: T) {
        self.release(image);
    }

    /// Returns an image whose submission may still be running.
    pub fn recycle(&self, image: T) {
        self.available.push_back(image);
    }

    /// Wakes the display thread; every later `next_for_display` reports shutdown.
    pub fn shutdown(&self) {
        self.filled.push_back(Filled::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        TooLarge,
        Size(FrameSizeMismatch),
    }

    impl From<FrameSizeMismatch> for FakeError {
        fn from(err: FrameSizeMismatch) -> Self {
            FakeError::Size(err)
        }
    }

    struct FakeImage {
        index: usize,
        description: Option<ImageDescription>,
        pixels: Vec<u8>,
        allocations: Arc<AtomicUsize>,
    }

    impl PoolImage for FakeImage {
        type Error = FakeError;

        fn pool_index(&self) -> usize {
            self.index
        }

        fn description(&self) -> Option<ImageDescription> {
            self.description
        }

        fn row_pitch(&self) -> usize {
            self.description.map_or(0, |d| d.packed_row_len())
        }

        fn pixels_mut(&mut self) -> &mut [u8] {
            &mut self.pixels
        }

        fn wait_until_free(&mut self) -> Result<(), FakeError> {
            Ok(())
        }

        fn create(&mut self, description: ImageDescription) -> Result<(), FakeError> {
            if description.width > 4096 {
                return Err(FakeError::TooLarge);
            }
            self.allocations.fetch_add(1, Ordering::SeqCst);
            self.pixels = vec![0; description.packed_len()];
            self.description = Some(description);
            Ok(())
        }
    }

    fn pool(count: usize) -> (ImagePool<FakeImage>, Arc<AtomicUsize>) {
        let allocations = Arc::new(AtomicUsize::new(0));
        let images = (0..count)
            .map(|index| FakeImage {
                index,
                description: None,
                pixels: Vec::new(),
                allocations: Arc::clone(&allocations),
            })
            .collect();
        (ImagePool::new(images), allocations)
    }

    const DESC: ImageDescription = ImageDescription::rgba(4, 2);

    fn displayed(pool: &ImagePool<FakeImage>) -> usize {
        match pool.next_for_display(false) {
            NextFrame::Frame(frame) => {
                let index = frame.pool_index();
                pool.recycle(frame.into_image());
                index
            }
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_filled_max_rounds_up() {
        assert_eq!(pool(1).0.filled_max(), 1);
        assert_eq!(pool(2).0.filled_max(), 1);
        assert_eq!(pool(3).0.filled_max(), 2);
        assert_eq!(pool(4).0.filled_max(), 2);
    }

    #[test]
    fn test_acquire_hands_out_distinct_images() {
        let (pool, _) = pool(3);
        let a = pool.acquire(DESC).unwrap();
        let b = pool.acquire(DESC).unwrap();
        let c = pool.acquire(DESC).unwrap();
        let mut indices = vec![a.pool_index(), b.pool_index(), c.pool_index()];
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(pool.available_len(), 0);
    }

    #[test]
    fn test_display_order_matches_queue_order() {
        let (pool, _) = pool(3);
        let handles: Vec<_> = (0..3).map(|_| pool.acquire(DESC).unwrap()).collect();
        let order: Vec<_> = handles.iter().rev().map(|h| h.pool_index()).collect();
        for handle in handles.into_iter().rev() {
            pool.queue(handle);
        }
        let shown: Vec<_> = (0..3).map(|_| displayed(&pool)).collect();
        assert_eq!(shown, order);
    }

    #[test]
    fn test_steal_oldest_when_backlog_exceeds_threshold() {
        let (pool, _) = pool(3);
        let pool = Arc::new(pool);
        let mut queued = Vec::new();
        for _ in 0..3 {
            let handle = pool.acquire(DESC).unwrap();
            queued.push(handle.pool_index());
            pool.queue(handle);
        }
        assert!(pool.filled_len() > pool.filled_max());

        let (tx, rx) = mpsc::channel();
        let producer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let handle = pool.acquire(DESC).unwrap();
                tx.send(handle.pool_index()).unwrap();
            })
        };
        let stolen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        assert_eq!(stolen, queued[0]);

        // The dropped handle went back to the available queue.
        assert_eq!(pool.filled_len(), 2);
        assert_eq!(displayed(&pool), queued[1]);
        assert_eq!(displayed(&pool), queued[2]);
    }

    #[test]
    fn test_acquire_blocks_until_display_recycles() {
        let (pool, _) = pool(2);
        let pool = Arc::new(pool);
        let first = pool.acquire(DESC).unwrap();
        pool.queue(first);
        let _held = pool.acquire(DESC).unwrap();
        assert_eq!(pool.filled_len(), pool.filled_max());

        let (tx, rx) = mpsc::channel();
        let producer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let handle = pool.acquire(DESC).unwrap();
                tx.send(handle.pool_index()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let shown = displayed(&pool);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), shown);
        producer.join().unwrap();
    }

    #[test]
    fn test_create_only_when_description_changes() {
        let (pool, allocations) = pool(1);
        drop(pool.acquire(DESC).unwrap());
        drop(pool.acquire(DESC).unwrap());
        assert_eq!(allocations.load(Ordering::SeqCst), 1);

        let handle = pool.acquire(ImageDescription::rgba(8, 8)).unwrap();
        assert_eq!(handle.description(), Some(ImageDescription::rgba(8, 8)));
        assert_eq!(allocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_create_returns_image() {
        let (pool, _) = pool(2);
        let err = pool.acquire(ImageDescription::rgba(5000, 1)).err();
        assert_eq!(err, Some(FakeError::TooLarge));
        assert_eq!(pool.available_len(), 2);
        assert!(pool.acquire(DESC).is_ok());
    }

    #[test]
    fn test_degenerate_window_discards_exactly_one() {
        let (pool, _) = pool(3);
        for _ in 0..2 {
            let handle = pool.acquire(DESC).unwrap();
            pool.queue(handle);
        }
        assert_eq!(pool.available_len(), 1);

        assert!(matches!(pool.next_for_display(true), NextFrame::Discarded));
        assert_eq!(pool.filled_len(), 1);
        assert_eq!(pool.available_len(), 2);

        assert!(matches!(pool.next_for_display(true), NextFrame::Discarded));
        assert!(matches!(pool.next_for_display(true), NextFrame::Idle));
        assert_eq!(pool.available_len(), 3);
    }

    #[test]
    fn test_shutdown_wakes_display() {
        let (pool, _) = pool(2);
        let pool = Arc::new(pool);
        let (tx, rx) = mpsc::channel();
        let display = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let shut = matches!(pool.next_for_display(false), NextFrame::Shutdown);
                tx.send(shut).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        pool.shutdown();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        display.join().unwrap();

        assert!(matches!(pool.next_for_display(false), NextFrame::Shutdown));
        assert!(matches!(pool.next_for_display(true), NextFrame::Shutdown));
    }

    #[test]
    fn test_steal_skips_shutdown_sentinel() {
        let (pool, _) = pool(3);
        pool.shutdown();
        let mut queued = Vec::new();
        for _ in 0..3 {
            let handle = pool.acquire(DESC).unwrap();
            queued.push(handle.pool_index());
            pool.queue(handle);
        }

        let stolen = pool.acquire(DESC).unwrap();
        assert_eq!(stolen.pool_index(), queued[0]);
        assert_eq!(pool.filled_len(), 3);
        assert!(matches!(pool.next_for_display(false), NextFrame::Shutdown));
    }

    #[test]
    fn test_shutdown_sentinel_does_not_count_toward_backlog() {
        let (pool, _) = pool(2);
        let pool = Arc::new(pool);
        pool.shutdown();
        let first = pool.acquire(DESC).unwrap();
        pool.queue(first);
        let held = pool.acquire(DESC).unwrap();
        let held_index = held.pool_index();

        let (tx, rx) = mpsc::channel();
        let producer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let handle = pool.acquire(DESC).unwrap();
                tx.send(handle.pool_index()).unwrap();
            })
        };
        // one real frame is not over filled_max, so nothing is stolen
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(pool.filled_len(), 2);

        drop(held);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), held_index);
        producer.join().unwrap();
    }

    #[test]
    fn test_transform_runs_once_on_display() {
        let (pool, _) = pool(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handle = pool.acquire(DESC).unwrap();
        assert!(!handle.has_transform());
        {
            let runs = Arc::clone(&runs);
            handle.set_transform(move |image: &mut FakeImage| {
                runs.fetch_add(1, Ordering::SeqCst);
                image.pixels_mut().fill(0xAB);
            });
        }
        assert!(handle.has_transform());
        pool.queue(handle);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let NextFrame::Frame(mut frame) = pool.next_for_display(false) else {
            panic!("expected a frame");
        };
        assert!(frame.apply_transform());
        assert!(!frame.apply_transform());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(frame.image_mut().pixels_mut().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_dropped_handle_goes_to_front() {
        let (pool, _) = pool(3);
        let handle = pool.acquire(DESC).unwrap();
        let index = handle.pool_index();
        drop(handle);
        assert_eq!(pool.available_len(), 3);
        assert_eq!(pool.acquire(DESC).unwrap().pool_index(), index);
    }

    #[test]
    fn test_recycle_goes_to_back() {
        let (pool, _) = pool(2);
        let handle = pool.acquire(DESC).unwrap();
        let index = handle.pool_index();
        pool.queue(handle);
        assert_eq!(displayed(&pool), index);
        assert_ne!(pool.acquire(DESC).unwrap().pool_index(), index);
    }

    #[test]
    fn test_copy_and_queue() {
        let (pool, _) = pool(1);
        let pixels: Vec<u8> = (0..DESC.packed_len() as u8).collect();
        pool.copy_and_queue(&pixels, DESC).unwrap();

        let NextFrame::Frame(mut frame) = pool.next_for_display(false) else {
            panic!("expected a frame");
        };
        assert_eq!(frame.image_mut().pixels_mut(), &pixels[..]);
    }

    #[test]
    fn test_copy_and_queue_rejects_short_input() {
        let (pool, allocations) = pool(1);
        let err = pool.copy_and_queue(&[0; 3], DESC).err();
        assert!(matches!(err, Some(FakeError::Size(_))));
        assert_eq!(pool.filled_len(), 0);
        assert_eq!(allocations.load(Ordering::SeqCst), 0);
    }
}
