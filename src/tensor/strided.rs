//! Strided iteration over contiguous runs
//!
//! A [`StridedCursor`] walks a tensor one maximal run at a time. The
//! innermost dimension always seeds the run; each outer dimension whose
//! stride equals `run_stride * run_len` is folded into it. Whatever is left
//! becomes a set of outer counters that [`StridedCursor::advance`] steps
//! through like an odometer.

use super::layout::TensorLayout;

/// One run of equally spaced elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// Element offset of the first element
    pub offset: usize,
    pub len: usize,
    /// Distance between consecutive elements
    pub stride: usize,
}

#[derive(Debug, Clone)]
pub struct StridedCursor {
    offset: usize,
    run_len: usize,
    run_stride: usize,
    /// Outer dimensions, innermost last
    outer_sizes: Vec<usize>,
    outer_strides: Vec<usize>,
    counters: Vec<usize>,
    exhausted: bool,
}

impl StridedCursor {
    /// Position at the first run of `layout`
    pub fn new(layout: &TensorLayout) -> Self {
        let sizes = layout.sizes();
        let strides = layout.strides();
        let rank = sizes.len();

        if layout.numel() == 0 {
            return StridedCursor {
                offset: layout.offset(),
                run_len: 0,
                run_stride: 1,
                outer_sizes: Vec::new(),
                outer_strides: Vec::new(),
                counters: Vec::new(),
                exhausted: true,
            };
        }
        if rank == 0 {
            return StridedCursor {
                offset: layout.offset(),
                run_len: 1,
                run_stride: 1,
                outer_sizes: Vec::new(),
                outer_strides: Vec::new(),
                counters: Vec::new(),
                exhausted: false,
            };
        }

        let mut run_len = sizes[rank - 1];
        let mut run_stride = strides[rank - 1];
        let mut split = rank - 1;
        while split > 0 {
            let i = split - 1;
            if sizes[i] != 1 && strides[i] != run_stride * run_len {
                break;
            }
            run_len *= sizes[i];
            split = i;
        }
        // Size-1 leading dims only add single-step counters
        let (outer_sizes, outer_strides): (Vec<usize>, Vec<usize>) = sizes[..split]
            .iter()
            .zip(&strides[..split])
            .filter(|(size, _)| **size != 1)
            .map(|(&size, &stride)| (size, stride))
            .unzip();

        StridedCursor {
            offset: layout.offset(),
            run_len,
            run_stride,
            counters: vec![0; outer_sizes.len()],
            outer_sizes,
            outer_strides,
            exhausted: false,
        }
    }

    /// The run under the cursor, `None` once exhausted
    pub fn current(&self) -> Option<Run> {
        if self.exhausted {
            return None;
        }
        Some(Run {
            offset: self.offset,
            len: self.run_len,
            stride: self.run_stride,
        })
    }

    /// Length of every run
    pub fn run_len(&self) -> usize {
        self.run_len
    }

    pub fn run_stride(&self) -> usize {
        self.run_stride
    }

    /// Number of outer counters
    pub fn outer_dims(&self) -> usize {
        self.outer_sizes.len()
    }

    /// Total number of runs, independent of position
    pub fn run_count(&self) -> usize {
        if self.run_len == 0 {
            0
        } else {
            self.outer_sizes.iter().product()
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Move to the next run. Returns false when iteration is complete.
    pub fn advance(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        for d in (0..self.counters.len()).rev() {
            self.counters[d] += 1;
            self.offset += self.outer_strides[d];
            if self.counters[d] < self.outer_sizes[d] {
                return true;
            }
            // Carry: rewind this dimension and step the next outer one
            self.offset -= self.outer_sizes[d] * self.outer_strides[d];
            self.counters[d] = 0;
        }
        self.exhausted = true;
        false
    }

    /// Remaining runs, starting with the current one
    pub fn runs(self) -> Runs {
        Runs { cursor: self }
    }
}

/// Iterator over the runs of a [`StridedCursor`]
#[derive(Debug, Clone)]
pub struct Runs {
    cursor: StridedCursor,
}

impl Iterator for Runs {
    type Item = Run;

    fn next(&mut self) -> Option<Run> {
        let run = self.cursor.current()?;
        self.cursor.advance();
        Some(run)
    }
}

impl TensorLayout {
    pub fn cursor(&self) -> StridedCursor {
        StridedCursor::new(self)
    }
}
