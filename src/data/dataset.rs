use burn::data::dataset::Dataset;

use crate::data::features::RelationFeature;

pub struct RelationDataset {
    features: Vec<RelationFeature>,
}

impl RelationDataset {
    pub fn new(features: Vec<RelationFeature>) -> Self { Self { features } }

    pub fn labels(&self) -> Vec<usize> {
        self.features.iter().map(|f| f.label).collect()
    }
}

impl Dataset<RelationFeature> for RelationDataset {
    fn get(&self, index: usize) -> Option<RelationFeature> {
        self.features.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.features.len()
    }
}
