//! Graph datasets and mini-batching
//!
//! [`GraphDataset`] owns per-sample [`Graph`]s; [`GraphDataLoader`] yields
//! them in batches of borrowed graphs ready for [`crate::to_graph_tuple`].
//! Every source of randomness is an explicit RNG handle.
//!
//! ```rust,ignore
//! let widths = train.feature_widths("features");
//! let mut loader = GraphDataLoader::new(&train, 32).with_shuffle(seed);
//! for batch in loader.epoch() {
//!     let input = to_graph_tuple_with_widths(&batch, "features", &widths, &device)?;
//! }
//! ```

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::graph::{Attributes, FeatureWidths, Graph};
use crate::{GraphNetError, Result};

/// An ordered collection of graphs
#[derive(Debug, Clone, Default)]
pub struct GraphDataset {
    graphs: Vec<Graph>,
}

impl GraphDataset {
    pub fn new(graphs: Vec<Graph>) -> Self {
        Self { graphs }
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Graph> {
        self.graphs.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Graph> {
        self.graphs.iter()
    }

    pub fn graphs(&self) -> &[Graph] {
        &self.graphs
    }

    /// Widths of `key` across the whole dataset, for batching with
    /// [`crate::graph::to_graph_tuple_with_widths`]
    pub fn feature_widths(&self, key: &str) -> FeatureWidths {
        FeatureWidths::infer(&self.graphs, key)
    }

    /// Shuffle, then split into `n_train` graphs and the rest
    pub fn random_split<R: Rng + ?Sized>(
        &self,
        n_train: usize,
        rng: &mut R,
    ) -> Result<(GraphDataset, GraphDataset)> {
        if n_train > self.len() {
            return Err(GraphNetError::Configuration(format!(
                "cannot take {n_train} training graphs from a dataset of {}",
                self.len()
            )));
        }

        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        let pick = |ids: &[usize]| -> GraphDataset {
            ids.iter().map(|&i| self.graphs[i].clone()).collect()
        };
        let (train, test) = order.split_at(n_train);
        Ok((pick(train), pick(test)))
    }
}

impl From<Vec<Graph>> for GraphDataset {
    fn from(graphs: Vec<Graph>) -> Self {
        Self::new(graphs)
    }
}

impl FromIterator<Graph> for GraphDataset {
    fn from_iter<I: IntoIterator<Item = Graph>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a GraphDataset {
    type Item = &'a Graph;
    type IntoIter = std::slice::Iter<'a, Graph>;

    fn into_iter(self) -> Self::IntoIter {
        self.graphs.iter()
    }
}

/// Mini-batch iterator over a [`GraphDataset`]
///
/// With shuffling enabled every call to [`GraphDataLoader::epoch`] draws a
/// fresh order from the loader's own seeded RNG, so runs are reproducible.
#[derive(Debug)]
pub struct GraphDataLoader<'a> {
    dataset: &'a GraphDataset,
    batch_size: usize,
    rng: Option<StdRng>,
}

impl<'a> GraphDataLoader<'a> {
    /// Sequential batches of up to `batch_size` graphs (at least one)
    pub fn new(dataset: &'a GraphDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            rng: None,
        }
    }

    /// Builder: shuffle every epoch with an RNG seeded from `seed`
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_shuffled(&self) -> bool {
        self.rng.is_some()
    }

    /// Number of batches per epoch
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Batches for one pass over the dataset
    pub fn epoch(&mut self) -> Batches<'a> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        Batches {
            dataset: self.dataset,
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// One epoch of batches; the last batch may be short
#[derive(Debug)]
pub struct Batches<'a> {
    dataset: &'a GraphDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Vec<&'a Graph>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.dataset.graphs[i])
            .collect();
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Batches<'_> {}

// =============================================================================
// Synthetic graphs
// =============================================================================

/// Shape of randomly generated input/target graphs
///
/// Every node, edge and global record gets an input vector under
/// `input_key` and a target vector under `target_key`, with values drawn
/// uniformly from `[1, 10)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomGraphConfig {
    pub min_nodes: usize,
    /// Exclusive upper bound on the node count
    pub max_nodes: usize,
    /// Probability of each ordered pair of distinct nodes being an edge
    pub edge_probability: f64,
    /// (input, target) widths of node vectors
    pub node_dims: (usize, usize),
    /// (input, target) widths of edge vectors
    pub edge_dims: (usize, usize),
    /// (input, target) widths of global vectors
    pub global_dims: (usize, usize),
    pub input_key: String,
    pub target_key: String,
}

impl Default for RandomGraphConfig {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            max_nodes: 20,
            edge_probability: 0.2,
            node_dims: (10, 1),
            edge_dims: (5, 2),
            global_dims: (1, 3),
            input_key: "features".into(),
            target_key: "target".into(),
        }
    }
}

impl RandomGraphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_nodes >= self.max_nodes {
            return Err(GraphNetError::Configuration(format!(
                "empty node range {}..{}",
                self.min_nodes, self.max_nodes
            )));
        }
        if !(0.0..=1.0).contains(&self.edge_probability) {
            return Err(GraphNetError::Configuration(format!(
                "edge_probability {} is not in [0, 1]",
                self.edge_probability
            )));
        }
        Ok(())
    }

    fn record<R: Rng + ?Sized>(&self, dims: (usize, usize), rng: &mut R) -> Attributes {
        let mut draw = |n: usize| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(1.0f32..10.0)).collect()
        };
        Attributes::new()
            .with(self.input_key.clone(), draw(dims.0))
            .with(self.target_key.clone(), draw(dims.1))
    }
}

/// Draw one random directed graph
pub fn random_graph<R: Rng + ?Sized>(config: &RandomGraphConfig, rng: &mut R) -> Result<Graph> {
    config.validate()?;

    let n = rng.gen_range(config.min_nodes..config.max_nodes);
    let mut graph = Graph::new().with_global(config.record(config.global_dims, rng));
    for _ in 0..n {
        graph.add_node(config.record(config.node_dims, rng));
    }
    for s in 0..n {
        for t in 0..n {
            if s != t && rng.gen_bool(config.edge_probability) {
                graph.add_edge(s, t, config.record(config.edge_dims, rng))?;
            }
        }
    }
    Ok(graph)
}

/// Draw `count` random graphs into a dataset
pub fn random_dataset<R: Rng + ?Sized>(
    config: &RandomGraphConfig,
    count: usize,
    rng: &mut R,
) -> Result<GraphDataset> {
    (0..count)
        .map(|_| random_graph(config, rng))
        .collect::<Result<Vec<_>>>()
        .map(GraphDataset::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{to_graph_tuple, to_graph_tuple_with_widths};
    use candle_core::Device;

    fn dataset(count: usize) -> GraphDataset {
        let mut rng = StdRng::seed_from_u64(7);
        random_dataset(&RandomGraphConfig::default(), count, &mut rng).unwrap()
    }

    #[test]
    fn test_random_graph_attributes() {
        let config = RandomGraphConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let g = random_graph(&config, &mut rng).unwrap();

        assert!((1..20).contains(&g.num_nodes()));
        assert_eq!(g.global().get("features").unwrap().len(), 1);
        assert_eq!(g.global().get("target").unwrap().len(), 3);
        for node in g.nodes() {
            assert_eq!(node.get("features").unwrap().len(), 10);
            assert!(node.get("features").unwrap().iter().all(|v| (1.0..10.0).contains(v)));
        }
        for edge in g.edges() {
            assert_ne!(edge.source, edge.target);
            assert_eq!(edge.attrs.get("target").unwrap().len(), 2);
        }
    }

    #[test]
    fn test_same_seed_same_graphs() {
        let a = dataset(5);
        let b = dataset(5);
        assert_eq!(a.graphs(), b.graphs());
    }

    #[test]
    fn test_loader_batches_cover_dataset() {
        let data = dataset(23);
        let mut loader = GraphDataLoader::new(&data, 10);
        let sizes: Vec<usize> = loader.epoch().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(loader.num_batches(), 3);

        let first = loader.epoch().next().unwrap();
        assert!(std::ptr::eq(first[0], data.get(0).unwrap()));
    }

    #[test]
    fn test_shuffled_loader_is_reproducible() {
        let data = dataset(30);
        let order = |seed| {
            let mut loader = GraphDataLoader::new(&data, 4).with_shuffle(seed);
            loader
                .epoch()
                .flatten()
                .map(|g| data.iter().position(|x| std::ptr::eq(x, g)).unwrap())
                .collect::<Vec<_>>()
        };

        let a = order(3);
        assert_eq!(a, order(3));
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_batches_feed_to_graph_tuple() {
        let data = dataset(12);
        let mut loader = GraphDataLoader::new(&data, 5).with_shuffle(0);
        for batch in loader.epoch() {
            let input = to_graph_tuple(&batch, "features", &Device::Cpu).unwrap();
            let target = to_graph_tuple(&batch, "target", &Device::Cpu).unwrap();
            assert_eq!(input.node_width(), 10);
            assert_eq!(input.global_width(), 1);
            assert_eq!(target.node_width(), 1);
            assert_eq!(target.global_width(), 3);
            assert_eq!(input.num_graphs(), batch.len());
        }
    }

    #[test]
    fn test_dataset_widths_cover_edgeless_batches() {
        let config = RandomGraphConfig {
            max_nodes: 3,
            edge_probability: 0.3,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let data = random_dataset(&config, 40, &mut rng).unwrap();
        let widths = data.feature_widths("target");
        assert_eq!(widths, FeatureWidths::new(1, 2, 3));

        let edgeless: Vec<&Graph> = data.iter().filter(|g| g.num_edges() == 0).collect();
        assert!(!edgeless.is_empty());
        let gt = to_graph_tuple_with_widths(&edgeless, "target", &widths, &Device::Cpu).unwrap();
        assert_eq!(gt.edge_attr().dims(), &[0, 2]);
    }

    #[test]
    fn test_random_split() {
        let data = dataset(10);
        let mut rng = StdRng::seed_from_u64(11);
        let (train, test) = data.random_split(9, &mut rng).unwrap();
        assert_eq!((train.len(), test.len()), (9, 1));
        assert!(data.random_split(11, &mut rng).is_err());
    }

    #[test]
    fn test_invalid_config() {
        let config = RandomGraphConfig {
            min_nodes: 5,
            max_nodes: 5,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            random_graph(&config, &mut rng),
            Err(GraphNetError::Configuration(_))
        ));
    }
}
