//! # olap-multi-index 使用案例
//!
//! 演示元组空间的主要操作：
//!
//! 1. 建立查询上下文，加入两个维度（笛卡尔积）
//! 2. 用 Filter 缩小维度 0
//! 3. 按包行遍历 MultiIndex
//! 4. 模拟连接：MINewContents 生成新一代内容（Materialized）
//! 5. 按维度 0 过滤结果（mi_filter_and）
//! 6. 并行构建：MultiIndexBuilder 生成 Multi-Materialized 组

use olap_multi_index::{
    DimensionVector, Filter, JoinTips, MIIterator, MINewContents, MultiIndex, MultiIndexBuilder,
    MultiIndexConfig, QueryContext, Result,
};

fn main() -> Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   olap-multi-index 演示                                   ");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. 上下文与维度
    // =========================================================================
    println!("【1】建立上下文（每包 16 行）并加入两个维度 ...");
    let ctx = QueryContext::new(MultiIndexConfig::default().with_pack_power(4).with_worker_threads(2))?;
    let mut mind = MultiIndex::new(ctx.clone());
    let orders    = mind.add_dimension_cross(40)?;
    let customers = mind.add_dimension_cross(5)?;
    println!("    layout = {mind}, tuples = {}\n", mind.num_tuples()?);

    // =========================================================================
    // 2. 过滤维度 0：只保留偶数行
    // =========================================================================
    println!("【2】维度 {orders} 只保留偶数行 ...");
    if let Some(f) = mind.updatable_filter(orders) {
        for row in (1..40).step_by(2) {
            f.reset(row)?;
        }
    }
    mind.update_num_tuples();
    println!("    tuples = {}\n", mind.num_tuples()?);

    // =========================================================================
    // 3. 按包行遍历
    // =========================================================================
    println!("【3】按包行遍历 ...");
    {
        let mut it = MIIterator::over_all(&mind)?;
        let mut packrows = 0;
        let mut rows = 0u64;
        while it.is_valid() {
            if it.packrow_started() {
                packrows += 1;
                println!("    packrow #{packrows}: 包 ({}, {}), {} 个元组",
                         it.cur_pack(orders), it.cur_pack(customers), it.pack_size_left());
            }
            rows += 1;
            it.advance();
        }
        println!("    共 {rows} 个元组\n");
    }

    // =========================================================================
    // 4. 模拟连接：order.row % 5 == customer.row
    // =========================================================================
    println!("【4】连接 orders ⋈ customers ...");
    let both = DimensionVector::all(2);
    let tips = JoinTips::new(2);
    let mut contents = MINewContents::new(&mind, &tips);
    contents.set_dimensions(&mind, &both);
    contents.init(&mind, 64)?;
    let mut joined = 0u64;
    {
        let mut it = MIIterator::new(&mind, &both)?;
        while it.is_valid() {
            if it.get(orders) % 5 == it.get(customers) {
                contents.set_new_table_value(orders, it.get(orders));
                contents.set_new_table_value(customers, it.get(customers));
                contents.commit_new_table_values()?;
                joined += 1;
            }
            it.advance();
        }
    }
    println!("    strategy = {:?}", contents.strategy());
    contents.commit(&mut mind, joined)?;
    println!("    layout = {mind}, tuples = {}\n", mind.num_tuples()?);

    // =========================================================================
    // 5. 只保留前一半结果
    // =========================================================================
    println!("【5】mi_filter_and：保留前一半元组 ...");
    let n = mind.num_tuples()?;
    let mut keep = Filter::new(n, mind.power(), false)?;
    keep.set_between(0, n / 2 - 1)?;
    let mut mit = MIIterator::new(&mind, &both)?;
    mind.mi_filter_and(&mut mit, &keep)?;
    drop(mit);
    println!("    layout = {mind}, tuples = {}\n", mind.num_tuples()?);

    // =========================================================================
    // 6. 并行构建
    // =========================================================================
    println!("【6】MultiIndexBuilder 并行生成自连接 ...");
    let mut fresh = MultiIndex::new(ctx);
    fresh.add_dimension_cross(1000)?;
    fresh.add_dimension_cross(1000)?;
    let mut builder = MultiIndexBuilder::new(&fresh, &JoinTips::new(2));
    builder.init(&fresh, 256, &[DimensionVector::all(2)]);
    builder.fill_parallel(4, |task, item| {
        for row in (task as u64 * 250)..((task as u64 + 1) * 250) {
            item.set_table_value(0, row);
            item.set_table_value(1, 999 - row);
            item.commit_table_values()?;
        }
        Ok(())
    })?;
    builder.commit(&mut fresh, 1000, false)?;
    println!("    layout = {fresh}, tuples = {}", fresh.num_tuples()?);

    println!("\n═══════════════════════════════════════════════════════════");
    println!("   演示完成");
    println!("═══════════════════════════════════════════════════════════");
    Ok(())
}
