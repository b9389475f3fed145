//! Streaming, bucketed embedding of per-sample descriptors.
//!
//! A producer (the caller's thread) publishes [`EmbeddingRecord`]s on a
//! bounded channel and finishes with [`StreamMessage::EndOfStream`]. A
//! consumer thread fills fixed-capacity buckets and hands each full bucket,
//! and the final partial one, to a [`Reducer`]. Reduced chunks are
//! concatenated in emission order and min-max normalized per column.
//!
//! Buckets are reduced independently, so coordinates from different
//! buckets are only locally comparable. A warning is logged whenever more
//! than one bucket is produced.

use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

use crate::config::EmbeddingConfig;
use crate::error::{AnalysisError, Result};
use crate::reduce::{ReduceError, Reducer};

/// Maximum number of embedding columns kept for display.
pub const MAX_DISPLAY_DIM: usize = 3;

/// One sample's flattened descriptor and label.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    /// Flattened descriptor.
    pub descriptor: Vec<f32>,
    /// Label, usually the subject id.
    pub label: String,
}

impl EmbeddingRecord {
    /// Create a new record.
    pub fn new(descriptor: Vec<f32>, label: impl Into<String>) -> Self {
        Self {
            descriptor,
            label: label.into(),
        }
    }
}

/// Message on the producer/consumer channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// A record.
    Record(EmbeddingRecord),
    /// No more records follow; carries the number the producer emitted.
    EndOfStream {
        /// Records emitted before this marker.
        emitted: usize,
    },
}

/// Producer half of the record channel.
#[derive(Debug)]
pub struct RecordSender {
    sender: Sender<StreamMessage>,
    emitted: usize,
}

impl RecordSender {
    /// Publish one record, blocking while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::ConsumerStopped`] once the consumer has
    /// given up; the producer should stop.
    pub fn send(&mut self, record: EmbeddingRecord) -> Result<()> {
        self.sender
            .send(StreamMessage::Record(record))
            .map_err(|_| AnalysisError::ConsumerStopped)?;
        self.emitted += 1;
        Ok(())
    }

    /// Records published so far.
    #[must_use]
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn finish(self) -> Result<usize> {
        let emitted = self.emitted;
        self.sender
            .send(StreamMessage::EndOfStream { emitted })
            .map_err(|_| AnalysisError::ConsumerStopped)?;
        Ok(emitted)
    }
}

/// Fixed-capacity run of records reduced as one unit.
#[derive(Debug)]
pub struct Bucket {
    capacity: usize,
    descriptors: Vec<f32>,
    labels: Vec<String>,
    width: Option<usize>,
}

impl Bucket {
    /// Create an empty bucket.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            descriptors: Vec::new(),
            labels: Vec::with_capacity(capacity),
            width: None,
        }
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if the bucket is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Check if the bucket reached capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Add a record.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::DescriptorMismatch`] if the descriptor
    /// length differs from the first record of the stream.
    pub fn push(&mut self, record: EmbeddingRecord) -> Result<()> {
        let width = *self.width.get_or_insert(record.descriptor.len());
        if record.descriptor.len() != width {
            return Err(AnalysisError::DescriptorMismatch(format!(
                "record '{}' has {} values, expected {}",
                record.label,
                record.descriptor.len(),
                width
            )));
        }
        self.descriptors.extend_from_slice(&record.descriptor);
        self.labels.push(record.label);
        Ok(())
    }

    fn view(&self) -> Result<ArrayView2<'_, f32>> {
        let width = self.width.unwrap_or(0);
        ArrayView2::from_shape((self.len(), width), &self.descriptors)
            .map_err(|e| AnalysisError::DescriptorMismatch(e.to_string()))
    }

    /// Empty the bucket, keeping the expected descriptor width.
    fn drain_labels(&mut self) -> Vec<String> {
        self.descriptors.clear();
        std::mem::take(&mut self.labels)
    }
}

/// Embedding of a whole stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// Coordinates `(N, D)` with every column in `[0, 1]`.
    pub coords: Array2<f32>,
    /// Labels in emission order.
    pub labels: Vec<String>,
    /// Number of buckets reduced.
    pub buckets: usize,
}

impl Embedding {
    /// Number of embedded records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if nothing was embedded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

struct Reduced {
    chunks: Vec<Array2<f32>>,
    labels: Vec<String>,
    received: usize,
    emitted: usize,
}

/// Producer/consumer embedding pipeline.
#[derive(Debug, Clone)]
pub struct StreamingEmbedder {
    bucket_capacity: usize,
    channel_capacity: usize,
}

impl StreamingEmbedder {
    /// Create an embedder.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero bucket or channel capacity.
    pub fn new(bucket_capacity: usize, channel_capacity: usize) -> Result<Self> {
        Self::from_config(&EmbeddingConfig {
            bucket_capacity,
            channel_capacity,
            ..Default::default()
        })
    }

    /// Create an embedder from a validated configuration.
    ///
    /// # Errors
    ///
    /// See [`EmbeddingConfig::validate`].
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bucket_capacity: config.bucket_capacity,
            channel_capacity: config.channel_capacity,
        })
    }

    /// Bucket capacity `K`.
    #[must_use]
    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    /// Embed records from an iterator.
    ///
    /// # Errors
    ///
    /// See [`StreamingEmbedder::run_with`].
    pub fn run<I, R>(&self, records: I, reducer: R) -> Result<Embedding>
    where
        I: IntoIterator<Item = EmbeddingRecord>,
        R: Reducer + Send,
    {
        self.run_with(
            |sender| {
                for record in records {
                    sender.send(record)?;
                }
                Ok(())
            },
            reducer,
        )
    }

    /// Embed records published by `produce` on the calling thread.
    ///
    /// The reducer runs on a dedicated consumer thread. If it fails, the
    /// consumer stops, the producer's next send fails and the reducer's
    /// error is returned. A failed reduction is never retried.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::ResourceExhausted`] if the reducer ran out
    /// of memory, [`AnalysisError::CountMismatch`] if records were lost or
    /// duplicated, a configuration error for fewer than 2 records, or the
    /// producer's own error.
    pub fn run_with<P, R>(&self, produce: P, mut reducer: R) -> Result<Embedding>
    where
        P: FnOnce(&mut RecordSender) -> Result<()>,
        R: Reducer + Send,
    {
        let (sender, receiver) = bounded::<StreamMessage>(self.channel_capacity);
        let capacity = self.bucket_capacity;

        let (produced, consumed) = thread::scope(|scope| {
            let consumer = thread::Builder::new()
                .name("gaitscope-embed".into())
                .spawn_scoped(scope, move || consume(receiver, capacity, &mut reducer))
                .map_err(AnalysisError::IoError)?;

            let mut records = RecordSender { sender, emitted: 0 };
            // The sender must be gone before joining, or the consumer waits forever.
            let produced = match produce(&mut records) {
                Ok(()) => records.finish(),
                Err(err) => {
                    drop(records);
                    Err(err)
                }
            };

            let consumed = consumer
                .join()
                .map_err(|panic| AnalysisError::ConsumerPanicked(panic_message(panic.as_ref())))?;
            Ok::<_, AnalysisError>((produced, consumed))
        })?;

        // A consumer failure explains a stopped producer, and a producer
        // failure explains a closed stream.
        let (emitted, reduced) = match (produced, consumed) {
            (_, Err(err)) if !matches!(err, AnalysisError::StreamClosed) => return Err(err),
            (Err(err), _) | (Ok(_), Err(err)) => return Err(err),
            (Ok(emitted), Ok(reduced)) => (emitted, reduced),
        };

        let buckets = reduced.chunks.len();
        if reduced.received != emitted || reduced.emitted != emitted {
            return Err(AnalysisError::CountMismatch {
                emitted,
                received: reduced.received,
            });
        }
        if buckets > 1 {
            tracing::warn!(
                "Embedding produced {} buckets of up to {} records; each bucket was reduced independently, \
                 so coordinates are only comparable within a bucket",
                buckets,
                capacity
            );
        }

        let views: Vec<_> = reduced.chunks.iter().map(Array2::view).collect();
        let coords = concatenate(Axis(0), &views).map_err(|e| AnalysisError::Reduction {
            bucket: buckets.saturating_sub(1),
            message: format!("reduced chunks differ in width: {e}"),
        })?;
        if coords.nrows() != emitted || reduced.labels.len() != emitted {
            return Err(AnalysisError::CountMismatch {
                emitted,
                received: coords.nrows(),
            });
        }

        Ok(Embedding {
            coords: normalize_columns(fit_display_dim(coords)),
            labels: reduced.labels,
            buckets,
        })
    }
}

fn consume<R: Reducer>(receiver: Receiver<StreamMessage>, capacity: usize, reducer: &mut R) -> Result<Reduced> {
    let mut bucket = Bucket::new(capacity);
    let mut out = Reduced {
        chunks: Vec::new(),
        labels: Vec::new(),
        received: 0,
        emitted: 0,
    };

    loop {
        match receiver.recv() {
            Ok(StreamMessage::Record(record)) => {
                out.received += 1;
                bucket.push(record)?;
                if bucket.is_full() {
                    flush(&mut bucket, capacity, reducer, &mut out)?;
                }
            }
            Ok(StreamMessage::EndOfStream { emitted }) => {
                out.emitted = emitted;
                if out.received < 2 {
                    return Err(gaitscope_core::CoreError::invalid_config(
                        "samples",
                        out.received,
                        "at least 2 samples are required to embed",
                    )
                    .into());
                }
                if !bucket.is_empty() {
                    flush(&mut bucket, capacity, reducer, &mut out)?;
                }
                return Ok(out);
            }
            Err(_) => return Err(AnalysisError::StreamClosed),
        }
    }
}

fn flush<R: Reducer>(bucket: &mut Bucket, capacity: usize, reducer: &mut R, out: &mut Reduced) -> Result<()> {
    let index = out.chunks.len();
    let records = bucket.len();
    tracing::debug!("Reducing bucket {} ({} records)", index, records);

    let reduced = reducer.reduce(bucket.view()?).map_err(|e| match e {
        ReduceError::ResourceExhausted(message) => AnalysisError::ResourceExhausted {
            bucket: index,
            records,
            capacity,
            message,
        },
        ReduceError::Failed(message) => AnalysisError::Reduction {
            bucket: index,
            message,
        },
    })?;
    if reduced.nrows() != records {
        return Err(AnalysisError::CountMismatch {
            emitted: records,
            received: reduced.nrows(),
        });
    }

    out.chunks.push(reduced);
    out.labels.extend(bucket.drain_labels());
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Keep at most three columns and pad a single column with zeros.
#[must_use]
pub fn fit_display_dim(coords: Array2<f32>) -> Array2<f32> {
    let (n, d) = coords.dim();
    if d > MAX_DISPLAY_DIM {
        tracing::warn!(
            "Embedding dimension {} exceeds {}; only the first {} dimensions are kept",
            d,
            MAX_DISPLAY_DIM,
            MAX_DISPLAY_DIM
        );
        return coords.slice(s![.., ..MAX_DISPLAY_DIM]).to_owned();
    }
    if d == 1 {
        let mut padded = Array2::zeros((n, 2));
        padded.column_mut(0).assign(&coords.column(0));
        return padded;
    }
    coords
}

/// Min-max normalize every column to `[0, 1]`, flooring a zero range to 1.
#[must_use]
pub fn normalize_columns(mut coords: Array2<f32>) -> Array2<f32> {
    for mut column in coords.axis_iter_mut(Axis(1)) {
        let min = column.iter().copied().fold(f32::INFINITY, f32::min);
        let max = column.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;
        let range = if range > 0.0 { range } else { 1.0 };
        column.mapv_inplace(|v| (v - min) / range);
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::reducer_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn records(n: usize) -> Vec<EmbeddingRecord> {
        (0..n)
            .map(|i| EmbeddingRecord::new(vec![i as f32, (i * i) as f32, 1.0], format!("{:03}", i)))
            .collect()
    }

    fn first_two_columns(calls: Arc<AtomicUsize>) -> impl Reducer + Send {
        reducer_fn(move |bucket| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(bucket.slice(s![.., ..2]).to_owned())
        })
    }

    #[test]
    fn test_thirty_seven_records_in_buckets_of_twenty() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&sizes);
        let counter = Arc::clone(&calls);
        let reducer = reducer_fn(move |bucket| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut sizes) = seen.lock() {
                sizes.push(bucket.nrows());
            }
            Ok(bucket.slice(s![.., ..2]).to_owned())
        });

        let embedder = StreamingEmbedder::new(20, 4).unwrap();
        let embedding = embedder.run(records(37), reducer).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sizes.lock().unwrap(), vec![20, 17]);
        assert_eq!(embedding.buckets, 2);
        assert_eq!(embedding.len(), 37);
        assert_eq!(embedding.coords.dim(), (37, 2));
        let expected: Vec<String> = (0..37).map(|i| format!("{:03}", i)).collect();
        assert_eq!(embedding.labels, expected);
    }

    #[test]
    fn test_reduce_count_is_ceil_n_over_k() {
        for (n, k) in [(2, 1), (10, 10), (11, 10), (40, 7), (5, 100)] {
            let calls = Arc::new(AtomicUsize::new(0));
            let embedder = StreamingEmbedder::new(k, 2).unwrap();
            let embedding = embedder.run(records(n), first_two_columns(Arc::clone(&calls))).unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), n.div_ceil(k), "n={n} k={k}");
            assert_eq!(embedding.len(), n);
        }
    }

    #[test]
    fn test_coordinates_are_normalized() {
        let embedder = StreamingEmbedder::new(8, 2).unwrap();
        let embedding = embedder
            .run(records(20), first_two_columns(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        for column in embedding.coords.axis_iter(Axis(1)) {
            let min = column.iter().copied().fold(f32::INFINITY, f32::min);
            let max = column.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            assert_eq!(min, 0.0);
            assert!((max - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_resource_exhaustion_stops_producer() {
        let embedder = StreamingEmbedder::new(5, 1).unwrap();
        let reducer = reducer_fn(|bucket| {
            Err(ReduceError::ResourceExhausted(format!("{} rows", bucket.nrows())))
        });

        let mut produced = 0;
        let err = embedder
            .run_with(
                |sender| {
                    for record in records(10_000) {
                        sender.send(record)?;
                        produced += 1;
                    }
                    Ok(())
                },
                reducer,
            )
            .unwrap_err();

        assert!(matches!(
            err,
            AnalysisError::ResourceExhausted {
                bucket: 0,
                records: 5,
                capacity: 5,
                ..
            }
        ));
        assert!(err.to_string().contains("smaller bucket capacity"));
        assert!(produced < 10_000);
    }

    #[test]
    fn test_wrong_row_count_is_fatal() {
        let embedder = StreamingEmbedder::new(4, 2).unwrap();
        let reducer = reducer_fn(|bucket| Ok(bucket.slice(s![1.., ..2]).to_owned()));
        let err = embedder.run(records(8), reducer).unwrap_err();
        assert!(matches!(err, AnalysisError::CountMismatch { emitted: 4, received: 3 }));
    }

    #[test]
    fn test_single_record_is_rejected() {
        let embedder = StreamingEmbedder::new(4, 2).unwrap();
        let err = embedder
            .run(records(1), first_two_columns(Arc::new(AtomicUsize::new(0))))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::CoreError(_)));
    }

    #[test]
    fn test_mixed_descriptor_lengths_are_rejected() {
        let mut input = records(3);
        input[2].descriptor.push(0.0);
        let embedder = StreamingEmbedder::new(4, 2).unwrap();
        let err = embedder
            .run(input, first_two_columns(Arc::new(AtomicUsize::new(0))))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::DescriptorMismatch(_)));
    }

    #[test]
    fn test_producer_error_is_returned() {
        let embedder = StreamingEmbedder::new(4, 2).unwrap();
        let err = embedder
            .run_with(
                |sender| {
                    sender.send(EmbeddingRecord::new(vec![1.0, 2.0], "a"))?;
                    Err(AnalysisError::Archive("source failed".to_string()))
                },
                first_two_columns(Arc::new(AtomicUsize::new(0))),
            )
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Archive(_)));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(StreamingEmbedder::new(0, 2).is_err());
        assert!(StreamingEmbedder::new(2, 0).is_err());
    }

    #[test]
    fn test_fit_display_dim() {
        let wide = Array2::from_shape_fn((3, 5), |(i, j)| (i * 5 + j) as f32);
        assert_eq!(fit_display_dim(wide).dim(), (3, 3));

        let narrow = Array2::from_shape_fn((3, 1), |(i, _)| i as f32);
        let padded = fit_display_dim(narrow);
        assert_eq!(padded.dim(), (3, 2));
        assert!(padded.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_constant_column_normalizes_to_zero() {
        let coords = Array2::from_elem((4, 2), 3.0_f32);
        assert!(normalize_columns(coords).iter().all(|&v| v == 0.0));
    }
}
