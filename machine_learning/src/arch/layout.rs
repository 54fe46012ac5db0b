use std::ops::Range;

use super::ModelArgs;

/// A named tensor inside the flat parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub range: Range<usize>,
    /// Whether weight decay applies to this tensor.
    pub decay: bool,
}

/// The weight and bias of one residual block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub weight: LayoutEntry,
    pub bias: LayoutEntry,
}

/// Maps a flat parameter buffer into named tensors.
///
/// Order in the buffer: token embedding, every block's weight then bias, LM head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterLayout {
    pub wte: LayoutEntry,
    pub blocks: Vec<BlockLayout>,
    pub lm_head: LayoutEntry,
}

impl ParameterLayout {
    pub fn new(args: &ModelArgs) -> Self {
        let (v, e) = (args.vocab_size, args.n_embd);
        let mut offset = 0;
        let mut entry = |name: String, shape: Vec<usize>, decay: bool| {
            let len: usize = shape.iter().product();
            let range = offset..offset + len;
            offset += len;
            LayoutEntry {
                name,
                shape,
                range,
                decay,
            }
        };

        let wte = entry("wte".into(), vec![v, e], false);
        let blocks = (0..args.n_layer)
            .map(|l| BlockLayout {
                weight: entry(format!("blocks.{l}.weight"), vec![e, e], true),
                bias: entry(format!("blocks.{l}.bias"), vec![e], false),
            })
            .collect();
        let lm_head = entry("lm_head".into(), vec![e, v], true);

        Self {
            wte,
            blocks,
            lm_head,
        }
    }

    /// Every entry in buffer order.
    pub fn entries(&self) -> impl Iterator<Item = &LayoutEntry> {
        std::iter::once(&self.wte)
            .chain(self.blocks.iter().flat_map(|b| [&b.weight, &b.bias]))
            .chain(std::iter::once(&self.lm_head))
    }

    /// Total amount of parameters.
    pub fn size(&self) -> usize {
        self.lm_head.range.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(n_layer: usize) -> ModelArgs {
        ModelArgs {
            n_layer,
            n_embd: 3,
            block_size: 4,
            vocab_size: 5,
            dropout: 0.0,
        }
    }

    #[test]
    fn entries_tile_the_buffer() {
        let layout = ParameterLayout::new(&args(2));
        let mut expected_start = 0;

        for entry in layout.entries() {
            assert_eq!(entry.range.start, expected_start);
            assert_eq!(entry.range.len(), entry.shape.iter().product::<usize>());
            expected_start = entry.range.end;
        }

        assert_eq!(layout.size(), expected_start);
        assert_eq!(layout.size(), 5 * 3 + 2 * (9 + 3) + 3 * 5);
    }

    #[test]
    fn only_matmul_weights_decay() {
        let layout = ParameterLayout::new(&args(1));
        let decayed: Vec<_> = layout
            .entries()
            .filter(|e| e.decay)
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(decayed, ["blocks.0.weight", "lm_head"]);
    }
}
