// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use super::BoundingBox;

pub const DEFAULT_NMS_ETA: f32 = 0.5;

/// 非极大值抑制，返回保留下来的下标（按输出顺序）
pub trait Suppressor {
  fn suppress(
    &self,
    boxes: &[BoundingBox],
    scores: &[f32],
    score_threshold: f32,
    iou_threshold: f32,
  ) -> Vec<usize>;
}

/// 与类别无关的贪心 NMS
///
/// 分数高于阈值的框按分数降序稳定排序（同分时保持输入顺序），依次与已保留的
/// 框比较，IoU 都不超过阈值才保留。`eta < 1` 且阈值大于 0.5 时，每保留一个框
/// 阈值乘以 `eta`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GreedyNms {
  pub eta: f32,
}

impl Default for GreedyNms {
  fn default() -> Self {
    Self {
      eta: DEFAULT_NMS_ETA,
    }
  }
}

impl Suppressor for GreedyNms {
  fn suppress(
    &self,
    boxes: &[BoundingBox],
    scores: &[f32],
    score_threshold: f32,
    iou_threshold: f32,
  ) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len()))
      .filter(|&i| scores[i] > score_threshold)
      .collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut threshold = iou_threshold;
    let mut kept: Vec<usize> = Vec::new();
    for candidate in order {
      let keep = kept
        .iter()
        .all(|&k| boxes[candidate].iou(&boxes[k]) <= threshold);
      if keep {
        kept.push(candidate);
        if self.eta < 1.0 && threshold > 0.5 {
          threshold *= self.eta;
        }
      }
    }
    kept
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
    BoundingBox { x, y, w, h }
  }

  #[test]
  fn overlapping_boxes_collapse_to_best() {
    let boxes = [
      bbox(0.0, 0.0, 10.0, 10.0),
      bbox(1.0, 1.0, 10.0, 10.0),
      bbox(50.0, 50.0, 10.0, 10.0),
    ];
    let scores = [0.6, 0.9, 0.7];
    let kept = GreedyNms::default().suppress(&boxes, &scores, 0.25, 0.45);
    assert_eq!(kept, vec![1, 2]);
  }

  #[test]
  fn scores_at_threshold_are_dropped() {
    let boxes = [bbox(0.0, 0.0, 1.0, 1.0), bbox(5.0, 5.0, 1.0, 1.0)];
    let kept = GreedyNms::default().suppress(&boxes, &[0.25, 0.26], 0.25, 0.45);
    assert_eq!(kept, vec![1]);
  }

  #[test]
  fn equal_scores_keep_input_order() {
    // 同分时结果由实现决定，但对固定输入是确定的：这里按输入顺序
    let boxes = [
      bbox(100.0, 0.0, 10.0, 10.0),
      bbox(0.0, 0.0, 10.0, 10.0),
      bbox(200.0, 0.0, 10.0, 10.0),
    ];
    let scores = [0.5, 0.5, 0.5];
    let nms = GreedyNms::default();
    let first = nms.suppress(&boxes, &scores, 0.1, 0.45);
    assert_eq!(first, vec![0, 1, 2]);
    assert_eq!(nms.suppress(&boxes, &scores, 0.1, 0.45), first);
  }

  #[test]
  fn adaptive_threshold_only_above_half() {
    // IoU = 0.6：阈值 0.7 时第二个框保留，之后阈值降为 0.35，第三个框被抑制
    let boxes = [
      bbox(0.0, 0.0, 10.0, 10.0),
      bbox(100.0, 0.0, 10.0, 10.0),
      bbox(2.5, 0.0, 10.0, 10.0),
    ];
    let scores = [0.9, 0.8, 0.7];
    let iou = boxes[0].iou(&boxes[2]);
    assert!((iou - 0.6).abs() < 1e-6);

    assert_eq!(
      GreedyNms { eta: 0.5 }.suppress(&boxes, &scores, 0.1, 0.7),
      vec![0, 1]
    );
    assert_eq!(
      GreedyNms { eta: 1.0 }.suppress(&boxes, &scores, 0.1, 0.7),
      vec![0, 1, 2]
    );
  }
}
