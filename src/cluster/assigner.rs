use anyhow::Result;
use log::info;

use super::ClusterId;
use crate::index::{Metadata, SimilarityIndex};

/// 近似重复图片的元数据列表，按相似度从高到低排列
pub type CandidateSet = Vec<Option<Metadata>>;

/// 每个聚类 ID 获得的票数，按首次出现的顺序保存
#[derive(Debug, Default)]
pub struct VoteTally<'a> {
    counts: Vec<(&'a ClusterId, usize)>,
}

impl<'a> VoteTally<'a> {
    /// 统计投票，没有元数据的候选不计票
    pub fn from_candidates(candidates: &'a [Option<Metadata>]) -> Self {
        let mut tally = Self::default();
        for metadata in candidates.iter().flatten() {
            tally.vote(&metadata.cluster_id);
        }
        tally
    }

    fn vote(&mut self, cluster_id: &'a ClusterId) {
        match self.counts.iter_mut().find(|(id, _)| *id == cluster_id) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((cluster_id, 1)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, cluster_id: &ClusterId) -> usize {
        self.counts.iter().find(|(id, _)| *id == cluster_id).map_or(0, |(_, count)| *count)
    }

    /// 票数最多的聚类 ID，平票时取最先出现的
    pub fn winner(&self) -> Option<&'a ClusterId> {
        let mut winner: Option<(&'a ClusterId, usize)> = None;
        for &(id, count) in &self.counts {
            if winner.is_none_or(|(_, best)| count > best) {
                winner = Some((id, count));
            }
        }
        winner.map(|(id, _)| id)
    }
}

/// 根据近似重复图片的聚类 ID 投票决定新图片的聚类
///
/// 所有候选票数相同，不考虑距离远近
#[derive(Debug, Clone)]
pub struct ClusterAssigner {
    distance_threshold: f32,
}

impl ClusterAssigner {
    pub fn new(distance_threshold: f32) -> Self {
        Self { distance_threshold }
    }

    pub fn distance_threshold(&self) -> f32 {
        self.distance_threshold
    }

    /// 查询图片的近似重复，返回它们的元数据
    pub async fn near_duplicates<I: SimilarityIndex>(
        &self,
        index: &I,
        reference: &str,
    ) -> Result<CandidateSet> {
        let hits = index.search_near_duplicates(reference, self.distance_threshold).await?;
        info!("找到 {} 张近似重复图片: {}", hits.len(), reference);
        Ok(hits.into_iter().map(|hit| hit.metadata).collect())
    }

    /// 多数投票决定聚类 ID，没有任何有效票时生成新的 ID
    pub fn assign(&self, candidates: &[Option<Metadata>]) -> ClusterId {
        match VoteTally::from_candidates(candidates).winner() {
            Some(winner) => {
                info!("聚类投票结果: {}", winner);
                winner.clone()
            }
            None => {
                let cluster_id = ClusterId::mint();
                info!("没有近似重复图片，分配新的聚类 ID: {}", cluster_id);
                cluster_id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rstest::rstest;

    use super::*;
    use crate::index::MemoryIndex;

    fn candidates(ids: &[Option<&str>]) -> CandidateSet {
        ids.iter().map(|id| id.map(|id| Metadata::new(id.into()))).collect()
    }

    #[rstest]
    #[case::unique_max(&[Some("A"), Some("A"), Some("B")], "A")]
    #[case::max_not_first(&[Some("B"), Some("A"), Some("A")], "A")]
    #[case::absent_ignored(&[None, Some("B"), None, None], "B")]
    #[case::tie_first_seen(&[Some("A"), Some("B")], "A")]
    #[case::tie_order_matters(&[Some("B"), Some("A")], "B")]
    #[case::late_tie_keeps_first(&[Some("C"), Some("B"), Some("B"), Some("C")], "C")]
    fn assign_majority(#[case] ids: &[Option<&str>], #[case] expected: &str) {
        let assigner = ClusterAssigner::new(0.1);
        assert_eq!(assigner.assign(&candidates(ids)), ClusterId::from(expected));
    }

    #[test]
    fn tie_break_is_deterministic() {
        let assigner = ClusterAssigner::new(0.1);
        let set = candidates(&[Some("A"), Some("B")]);
        for _ in 0..100 {
            assert_eq!(assigner.assign(&set), ClusterId::from("A"));
        }
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::all_absent(&[None, None, None])]
    fn assign_mints_unique_ids(#[case] ids: &[Option<&str>]) {
        let assigner = ClusterAssigner::new(0.1);
        let set = candidates(ids);
        let minted = (0..10_000).map(|_| assigner.assign(&set)).collect::<HashSet<_>>();
        assert_eq!(minted.len(), 10_000);
    }

    #[test]
    fn tally_counts_votes() {
        let set = candidates(&[Some("A"), None, Some("B"), Some("A")]);
        let tally = VoteTally::from_candidates(&set);
        assert_eq!(tally.count(&"A".into()), 2);
        assert_eq!(tally.count(&"B".into()), 1);
        assert_eq!(tally.count(&"C".into()), 0);
        assert!(!tally.is_empty());
        assert!(VoteTally::from_candidates(&candidates(&[None])).is_empty());
    }

    #[tokio::test]
    async fn near_duplicates_respects_threshold() {
        let index = MemoryIndex::with_distance(|a, b| if a[..3] == b[..3] { 0.05 } else { 0.5 });
        index.insert("cat-1", Some(Metadata::new("C".into())));
        index.insert("cat-2", None);
        index.insert("dog-1", Some(Metadata::new("D".into())));

        let assigner = ClusterAssigner::new(0.1);
        let set = assigner.near_duplicates(&index, "cat-3").await.unwrap();
        assert_eq!(set, candidates(&[Some("C"), None]));
    }
}
