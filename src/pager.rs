use tokio_util::sync::CancellationToken;

use crate::dao::TaskDao;
use crate::error::Result;
use crate::task::Task;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Loads tasks page by page and keeps everything loaded so far.
///
/// A page shorter than the page size marks the end; later calls to
/// [`TaskPager::load_more`] return nothing until [`TaskPager::reset`].
pub struct TaskPager<D> {
    dao: D,
    page_size: u32,
    offset: u32,
    last_page: bool,
    tasks: Vec<Task>,
}

impl<D: TaskDao> TaskPager<D> {
    pub fn new(dao: D) -> Self {
        Self::with_page_size(dao, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(dao: D, page_size: u32) -> Self {
        Self {
            dao,
            page_size: page_size.max(1),
            offset: 0,
            last_page: false,
            tasks: Vec::new(),
        }
    }

    /// Fetch the next page and return the tasks it added.
    ///
    /// A failed or cancelled fetch leaves the pager unchanged.
    pub async fn load_more(&mut self, cancel: &CancellationToken) -> Result<&[Task]> {
        if self.last_page {
            return Ok(&[]);
        }
        let page = self
            .dao
            .fetch_page(self.page_size, self.offset, cancel)
            .await?;
        match self.offset.checked_add(self.page_size) {
            Some(next) if page.len() >= self.page_size as usize => self.offset = next,
            // Short page, or no offset left to address the next one.
            _ => self.last_page = true,
        }
        let start = self.tasks.len();
        self.tasks.extend(page);
        Ok(&self.tasks[start..])
    }

    /// Forget everything loaded and start again from the newest task.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.last_page = false;
        self.tasks.clear();
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn is_last_page(&self) -> bool {
        self.last_page
    }

    pub fn dao(&self) -> &D {
        &self.dao
    }
}
